//! Engine dispatch and the programmatic surface consumed by a UI.
//!
//! A [`SimulatorEngine`] owns the routing matrix and runs one protocol
//! server over it. The concrete frontend is chosen by [`Protocol`] name;
//! callers only ever see this type, its events, and snapshots. Local
//! mutations go through the same model path as wire writes, so they
//! broadcast identically.

use crate::frontend::{GvNativeFrontend, Swp08Frontend, VideohubFrontend};
use crate::matrix::{
    LabelChange, LockChange, LockOp, MatrixConfig, MatrixEvent, MatrixSnapshot, PeerId,
    RouteChange, RoutingMatrix,
};
use anyhow::{anyhow, Result};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Videohub,
    Swp08,
    GvNative,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Videohub => 9990,
            Protocol::Swp08 => 8910,
            Protocol::GvNative => 12345,
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "videohub" => Ok(Protocol::Videohub),
            "swp08" | "sw-p-08" | "probel" => Ok(Protocol::Swp08),
            "gvnative" | "gv-native" | "native" => Ok(Protocol::GvNative),
            other => Err(anyhow!("unknown protocol {other:?}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Protocol::Videohub => "videohub",
            Protocol::Swp08 => "swp08",
            Protocol::GvNative => "gvnative",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub protocol: Protocol,
    pub inputs: u16,
    pub outputs: u16,
    pub levels: u16,
    pub port: u16,
    pub interface: String,
    pub model_name: String,
    pub friendly_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let matrix = MatrixConfig::default();
        Self {
            protocol: Protocol::Videohub,
            inputs: matrix.inputs,
            outputs: matrix.outputs,
            levels: matrix.levels,
            port: Protocol::Videohub.default_port(),
            interface: "0.0.0.0".into(),
            model_name: matrix.model_name,
            friendly_name: matrix.friendly_name,
        }
    }
}

impl EngineConfig {
    pub fn matrix_config(&self) -> MatrixConfig {
        MatrixConfig {
            levels: self.levels.max(1),
            inputs: self.inputs,
            outputs: self.outputs,
            model_name: self.model_name.clone(),
            friendly_name: self.friendly_name.clone(),
            ..MatrixConfig::default()
        }
    }
}

/// Everything a UI needs to follow both the simulator and the
/// controllers, without polling.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    ServerStarted(u16),
    ServerStopped,
    ClientConnected(String),
    ClientDisconnected(String),
    RoutingChanged(Vec<RouteChange>),
    LocksChanged(Vec<LockChange>),
    InputLabelsChanged(Vec<LabelChange>),
    OutputLabelsChanged(Vec<LabelChange>),
    CommandReceived { id: String, description: String },
    Error(String),
    RouterConnected,
    RouterDisconnected,
    RouterReconnecting(u32),
}

/// Queue depth for the UI subscriber channel.
const UI_QUEUE_DEPTH: usize = 256;

struct RunningServer {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    port: u16,
}

pub struct SimulatorEngine {
    matrix: Arc<RoutingMatrix>,
    ui: broadcast::Sender<EngineEvent>,
    config: Mutex<EngineConfig>,
    server: tokio::sync::Mutex<Option<RunningServer>>,
    pump: JoinHandle<()>,
}

impl SimulatorEngine {
    /// Build the engine; the server is not started until [`start`].
    ///
    /// [`start`]: SimulatorEngine::start
    pub fn new(config: EngineConfig) -> Self {
        let matrix = Arc::new(RoutingMatrix::new(config.matrix_config()));
        let (ui, _) = broadcast::channel(UI_QUEUE_DEPTH);
        let pump = tokio::spawn(pump_events(matrix.subscribe(), ui.clone()));
        Self {
            matrix,
            ui,
            config: Mutex::new(config),
            server: tokio::sync::Mutex::new(None),
            pump,
        }
    }

    /// Bind and serve the configured protocol; returns the actual port
    /// (useful with port 0).
    pub async fn start(&self) -> Result<u16> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(anyhow!("engine already started"));
        }
        let config = self.config.lock().unwrap().clone();
        let listener = TcpListener::bind((config.interface.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let (stop, shutdown) = watch::channel(false);
        let matrix = Arc::clone(&self.matrix);
        let ui = self.ui.clone();
        let task = match config.protocol {
            Protocol::Videohub => {
                tokio::spawn(Arc::new(VideohubFrontend::new(matrix, ui)).serve(listener, shutdown))
            }
            Protocol::Swp08 => {
                tokio::spawn(Arc::new(Swp08Frontend::new(matrix, ui)).serve(listener, shutdown))
            }
            Protocol::GvNative => {
                tokio::spawn(Arc::new(GvNativeFrontend::new(matrix, ui)).serve(listener, shutdown))
            }
        };
        *server = Some(RunningServer { stop, task, port });
        info!(port, protocol = %config.protocol, "server started");
        let _ = self.ui.send(EngineEvent::ServerStarted(port));
        Ok(port)
    }

    /// Graceful stop: close the listener, close all peers, drain.
    pub async fn stop(&self) {
        let mut server = self.server.lock().await;
        if let Some(running) = server.take() {
            let _ = running.stop.send(true);
            match running.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "server task failed"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
            info!("server stopped");
            let _ = self.ui.send(EngineEvent::ServerStopped);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.server.lock().await.as_ref().map(|s| s.port)
    }

    /// Swap configuration. The matrix is re-shaped when its dimensions or
    /// identity changed; the listener is restarted when the transport
    /// setup changed while running.
    pub async fn update_config(&self, config: EngineConfig) -> Result<()> {
        let restart_needed = {
            let mut current = self.config.lock().unwrap();
            let restart = current.protocol != config.protocol
                || current.port != config.port
                || current.interface != config.interface;
            *current = config.clone();
            restart
        };
        let matrix_config = config.matrix_config();
        if self.matrix.config() != matrix_config {
            self.matrix.reconfigure(matrix_config);
        }
        if restart_needed && self.is_running().await {
            self.stop().await;
            self.start().await?;
        }
        Ok(())
    }

    pub fn config(&self) -> EngineConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn set_route(&self, level: u16, dest: u16, src: u16) -> bool {
        self.matrix
            .set_routes(&[RouteChange { level, dest, src }], PeerId::LOCAL)
            .any_accepted()
    }

    pub fn set_input_label(&self, index: u16, text: impl Into<String>) -> bool {
        self.matrix
            .set_input_labels(&[LabelChange {
                index,
                text: text.into(),
            }])
            .any_accepted()
    }

    pub fn set_output_label(&self, index: u16, text: impl Into<String>) -> bool {
        self.matrix
            .set_output_labels(&[LabelChange {
                index,
                text: text.into(),
            }])
            .any_accepted()
    }

    pub fn set_lock(&self, dest: u16, op: LockOp) -> bool {
        self.matrix
            .set_locks(&[(dest, op)], PeerId::LOCAL)
            .any_accepted()
    }

    pub fn get_state(&self) -> MatrixSnapshot {
        self.matrix.snapshot(PeerId::LOCAL)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ui.subscribe()
    }

    /// The subscriber channel as a stream; lagged gaps are dropped.
    pub fn event_stream(&self) -> BoxStream<'static, EngineEvent> {
        let stream = BroadcastStream::new(self.ui.subscribe()).filter_map(|r| r.ok());
        Box::pin(stream)
    }

    /// Shared routing model, for embedding and tests.
    pub fn matrix(&self) -> Arc<RoutingMatrix> {
        Arc::clone(&self.matrix)
    }
}

impl Drop for SimulatorEngine {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Forward model changes to the UI subscriber channel. A lagging UI is
/// marked degraded with an `Error` event instead of blocking anything.
async fn pump_events(
    mut events: broadcast::Receiver<MatrixEvent>,
    ui: broadcast::Sender<EngineEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let mapped = match event {
                    MatrixEvent::Routed(changes) => EngineEvent::RoutingChanged(changes),
                    MatrixEvent::LocksChanged(changes) => EngineEvent::LocksChanged(changes),
                    MatrixEvent::InputLabelsChanged(changes) => {
                        EngineEvent::InputLabelsChanged(changes)
                    }
                    MatrixEvent::OutputLabelsChanged(changes) => {
                        EngineEvent::OutputLabelsChanged(changes)
                    }
                    MatrixEvent::LevelNamesChanged(_) => continue,
                };
                let _ = ui.send(mapped);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let _ = ui.send(EngineEvent::Error(format!(
                    "event subscriber degraded, {missed} updates dropped"
                )));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};

    fn test_config(protocol: Protocol) -> EngineConfig {
        EngineConfig {
            protocol,
            port: 0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn protocol_names() {
        assert_eq!("videohub".parse::<Protocol>().unwrap(), Protocol::Videohub);
        assert_eq!("SW-P-08".parse::<Protocol>().unwrap(), Protocol::Swp08);
        assert_eq!("gvnative".parse::<Protocol>().unwrap(), Protocol::GvNative);
        assert!("rs422".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Swp08.default_port(), 8910);
        assert_eq!(Protocol::GvNative.to_string(), "gvnative");
    }

    #[tokio::test]
    async fn start_serves_and_stop_drains() {
        let engine = SimulatorEngine::new(test_config(Protocol::Videohub));
        let mut events = engine.subscribe();

        let port = engine.start().await.unwrap();
        assert!(port > 0);
        assert_eq!(events.recv().await.unwrap(), EngineEvent::ServerStarted(port));
        assert!(engine.start().await.is_err(), "double start must fail");

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        engine.stop().await;
        // connected peer is closed by the drain
        let mut chunk = [0u8; 4096];
        let closed = timeout(Duration::from_secs(5), async {
            loop {
                if stream.read(&mut chunk).await.unwrap() == 0 {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn local_writes_reach_the_ui_channel() {
        let engine = SimulatorEngine::new(test_config(Protocol::Videohub));
        let mut events = engine.subscribe();

        assert!(engine.set_route(0, 2, 9));
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::RoutingChanged(vec![RouteChange {
                level: 0,
                dest: 2,
                src: 9
            }])
        );

        assert!(engine.set_input_label(0, "Cam"));
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::InputLabelsChanged(vec![LabelChange {
                index: 0,
                text: "Cam".into()
            }])
        );

        assert!(!engine.set_route(0, 99, 0), "out of bounds must fail");
        assert_eq!(engine.get_state().route(0, 2), Some(9));
    }

    #[tokio::test]
    async fn update_config_reshapes_matrix() {
        let engine = SimulatorEngine::new(test_config(Protocol::Videohub));
        let mut config = engine.config();
        config.inputs = 4;
        config.outputs = 4;
        config.levels = 2;
        engine.update_config(config).await.unwrap();

        let snap = engine.get_state();
        assert_eq!(snap.config.inputs, 4);
        assert_eq!(snap.routes.len(), 2);
    }

    #[tokio::test]
    async fn update_config_restarts_on_protocol_change() {
        let engine = SimulatorEngine::new(test_config(Protocol::Videohub));
        engine.start().await.unwrap();

        let mut config = engine.config();
        config.protocol = Protocol::GvNative;
        engine.update_config(config).await.unwrap();
        assert!(engine.is_running().await);
        let port = engine.port().await.unwrap();

        // a native query must now be answered on the new listener
        let mut framed = tokio_util::codec::Framed::new(
            TcpStream::connect(("127.0.0.1", port)).await.unwrap(),
            gvnative::GvCodec,
        );
        use futures_util::SinkExt;
        framed
            .send(gvnative::Frame::new("BK", vec!["d".into()]))
            .await
            .unwrap();
        let item = timeout(Duration::from_secs(5), StreamExt::next(&mut framed))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match item {
            gvnative::GvItem::Frame(f) => assert_eq!(f.command, "BK"),
            other => panic!("unexpected {:?}", other),
        }
        engine.stop().await;
    }
}
