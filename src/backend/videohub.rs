//! Videohub controller.
//!
//! Speaks to a peer implementing the Videohub Ethernet Protocol. The
//! server volunteers the full state dump on connect, so `connect()`
//! resolves once counts and at least one routing entry have been
//! absorbed. Every request block is answered with ACK or NAK in order,
//! which lets a FIFO of sent update kinds attribute an uncorrelated NAK
//! to the route or lock family for rollback.

use super::{not_connected, Backoff, ClientState, ControllerOptions, Mirror, PendingKind};
use crate::engine::EngineEvent;
use crate::matrix::{LockOp, LockView};
use anyhow::{anyhow, Result};
use futures_core::stream::BoxStream;
use futures_util::SinkExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use videohub::{HubCodec, HubMessage, Label, LockEntry, LockState, Route};

type HubFramed = Framed<TcpStream, HubCodec>;

/// Minimum protocol generation we know how to mirror.
const MIN_VERSION: &str = "2.0";

struct Outgoing {
    msg: HubMessage,
    /// Which pending family an eventual NAK for this block rolls back.
    kind: Option<PendingKind>,
}

#[derive(Default)]
struct Session {
    cmd_tx: Option<mpsc::UnboundedSender<Outgoing>>,
    task: Option<JoinHandle<()>>,
}

pub struct VideohubController {
    opts: ControllerOptions,
    state: Arc<ClientState>,
    session: Mutex<Session>,
    cancel: watch::Sender<bool>,
}

impl VideohubController {
    pub fn new(opts: ControllerOptions) -> Self {
        let state = Arc::new(ClientState::new(&opts));
        let (cancel, _) = watch::channel(false);
        Self {
            opts,
            state,
            session: Mutex::new(Session::default()),
            cancel,
        }
    }

    /// Connect and wait for initial state. Re-enables auto-reconnect
    /// after a manual disconnect.
    pub async fn connect(&self) -> Result<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.cancel.send_replace(false);
        let mut cancelled = self.cancel.subscribe();
        let framed = select! {
            established = establish(&self.opts, &self.state) => established?,
            _ = cancelled.changed() => return Err(anyhow!("connect cancelled")),
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut session = self.session.lock().unwrap();
        if let Some(task) = session.task.take() {
            task.abort();
        }
        session.cmd_tx = Some(cmd_tx);
        session.task = Some(tokio::spawn(run(
            self.opts.clone(),
            Arc::clone(&self.state),
            framed,
            cmd_rx,
        )));
        Ok(())
    }

    /// Tear the connection down and disable reconnection.
    pub async fn disconnect(&self) {
        self.cancel.send_replace(true);
        let task = {
            let mut session = self.session.lock().unwrap();
            session.cmd_tx = None;
            session.task.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if self.state.is_connected() {
            self.state.set_connected(false);
            self.state.clear_pending();
            self.state.emit(EngineEvent::RouterDisconnected);
        }
        info!("videohub controller disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Optimistic crosspoint write; the level is ignored, Videohub
    /// routers have exactly one. The pending record is pushed before the
    /// block goes out so a fast NAK still finds it.
    pub fn set_route(&self, _level: u16, dest: u16, src: u16) -> Result<()> {
        if !self.state.is_connected() {
            return Err(not_connected());
        }
        self.state.optimistic_route(0, dest, src);
        if let Err(e) = self.send(
            HubMessage::OutputRouting(vec![Route { dest, src }].into()),
            Some(PendingKind::Route),
        ) {
            self.state.rollback(PendingKind::Route);
            return Err(e);
        }
        Ok(())
    }

    /// Optimistic lock write.
    pub fn set_lock(&self, dest: u16, op: LockOp) -> Result<()> {
        if !self.state.is_connected() {
            return Err(not_connected());
        }
        let (wire, view) = match op {
            LockOp::Own => (LockState::Owned, LockView::Owned),
            LockOp::Unlock => (LockState::Unlocked, LockView::Unlocked),
            LockOp::Force => (LockState::ForceUnlock, LockView::Unlocked),
        };
        self.state.optimistic_lock(dest, view);
        if let Err(e) = self.send(
            HubMessage::OutputLocks(vec![LockEntry { dest, state: wire }].into()),
            Some(PendingKind::Lock),
        ) {
            self.state.rollback(PendingKind::Lock);
            return Err(e);
        }
        Ok(())
    }

    pub fn set_input_label(&self, index: u16, text: impl Into<String>) -> Result<()> {
        self.send(
            HubMessage::InputLabels(
                vec![Label {
                    index,
                    text: text.into(),
                }]
                .into(),
            ),
            None,
        )
    }

    pub fn set_output_label(&self, index: u16, text: impl Into<String>) -> Result<()> {
        self.send(
            HubMessage::OutputLabels(
                vec![Label {
                    index,
                    text: text.into(),
                }]
                .into(),
            ),
            None,
        )
    }

    pub fn state(&self) -> Mirror {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.ui.subscribe()
    }

    pub fn event_stream(&self) -> BoxStream<'static, EngineEvent> {
        Box::pin(BroadcastStream::new(self.state.ui.subscribe()).filter_map(|r| r.ok()))
    }

    fn send(&self, msg: HubMessage, kind: Option<PendingKind>) -> Result<()> {
        if !self.state.is_connected() {
            return Err(not_connected());
        }
        let session = self.session.lock().unwrap();
        let tx = session.cmd_tx.as_ref().ok_or_else(not_connected)?;
        tx.send(Outgoing { msg, kind }).map_err(|_| not_connected())
    }
}

/// TCP connect, then absorb the dump until initial state holds.
async fn establish(opts: &ControllerOptions, state: &Arc<ClientState>) -> Result<HubFramed> {
    let stream = timeout(
        opts.connect_timeout,
        TcpStream::connect((opts.host.as_str(), opts.port)),
    )
    .await
    .map_err(|_| anyhow!("connect to {}:{} timed out", opts.host, opts.port))??;
    let mut framed = Framed::new(stream, HubCodec);

    let mut scratch = VecDeque::new();
    timeout(opts.connect_timeout, async {
        while !state.has_initial_state() {
            let msg = framed
                .next()
                .await
                .ok_or_else(|| anyhow!("EOF during initial dump"))??;
            absorb(state, msg, &mut scratch);
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for initial state"))??;

    state.set_connected(true);
    state.emit(EngineEvent::RouterConnected);
    info!(host = %opts.host, port = opts.port, "videohub controller connected");
    Ok(framed)
}

/// Session supervisor: pump one session, then keep reconnecting with
/// backoff while allowed.
async fn run(
    opts: ControllerOptions,
    state: Arc<ClientState>,
    mut framed: HubFramed,
    mut cmd_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    loop {
        session(&state, &mut framed, &mut cmd_rx).await;
        state.set_connected(false);
        state.clear_pending();
        state.emit(EngineEvent::RouterDisconnected);
        if !opts.auto_reconnect {
            return;
        }

        let mut backoff = Backoff::new();
        let mut attempt = 0u32;
        framed = loop {
            attempt += 1;
            state.emit(EngineEvent::RouterReconnecting(attempt));
            tokio::time::sleep(backoff.next()).await;
            match establish(&opts, &state).await {
                Ok(framed) => break framed,
                Err(e) => {
                    debug!(error = %e, attempt, "reconnect attempt failed");
                    state.emit(EngineEvent::Error(format!("reconnect failed: {e}")));
                }
            }
        };
    }
}

/// One connected session; returns when the peer goes away.
async fn session(
    state: &Arc<ClientState>,
    framed: &mut HubFramed,
    cmd_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
) {
    // request blocks are answered in order, so sent kinds pair with
    // ACK/NAK replies FIFO
    let mut sent: VecDeque<Option<PendingKind>> = VecDeque::new();
    loop {
        select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(out) => {
                    sent.push_back(out.kind);
                    if framed.send(out.msg).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            maybe = framed.next() => match maybe {
                Some(Ok(msg)) => absorb(state, msg, &mut sent),
                Some(Err(e)) => {
                    state.emit(EngineEvent::Error(format!("videohub stream error: {e}")));
                    return;
                }
                None => return,
            },
        }
    }
}

/// Fold one received block into the mirror.
fn absorb(
    state: &Arc<ClientState>,
    msg: HubMessage,
    sent: &mut VecDeque<Option<PendingKind>>,
) {
    match msg {
        HubMessage::Ack => {
            sent.pop_front();
        }
        HubMessage::Nak => match sent.pop_front().flatten() {
            Some(kind) => state.rollback(kind),
            None => warn!("NAK without a pending update"),
        },
        HubMessage::ProtocolPreamble(preamble) => {
            if !preamble.at_least(MIN_VERSION) {
                warn!(version = %preamble.version, "peer speaks an older protocol than expected");
            }
        }
        HubMessage::DeviceInfo(di) => {
            if let (Some(inputs), Some(outputs)) = (di.video_inputs, di.video_outputs) {
                state.set_counts(inputs, outputs);
            }
            state.set_identity(di.model_name, di.friendly_name);
        }
        HubMessage::InputLabels(body) => {
            for label in &body.entries {
                state.absorb_input_label(label.index, &label.text);
            }
        }
        HubMessage::OutputLabels(body) => {
            for label in &body.entries {
                state.absorb_output_label(label.index, &label.text);
            }
        }
        HubMessage::OutputRouting(body) => {
            for route in &body.entries {
                state.authoritative_route(0, route.dest, route.src);
            }
        }
        HubMessage::OutputLocks(body) => {
            for lock in &body.entries {
                let view = match lock.state {
                    LockState::Owned => LockView::Owned,
                    LockState::Locked => LockView::Locked,
                    LockState::Unlocked | LockState::ForceUnlock => LockView::Unlocked,
                };
                state.authoritative_lock(lock.dest, view);
            }
        }
        HubMessage::Configuration(_)
        | HubMessage::Ping
        | HubMessage::EndPrelude
        | HubMessage::Unknown { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::VideohubFrontend;
    use crate::matrix::{MatrixConfig, PeerId, RouteChange, RoutingMatrix};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    async fn spawn_frontend() -> (SocketAddr, Arc<RoutingMatrix>, watch::Sender<bool>) {
        let matrix = Arc::new(RoutingMatrix::new(MatrixConfig::default()));
        let (ui, _) = broadcast::channel(64);
        let frontend = Arc::new(VideohubFrontend::new(Arc::clone(&matrix), ui));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(frontend.serve(listener, shutdown));
        (addr, matrix, stop)
    }

    fn controller_for(addr: SocketAddr) -> VideohubController {
        VideohubController::new(ControllerOptions::new(addr.ip().to_string(), addr.port()))
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let ev = events.recv().await.unwrap();
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn connect_resolves_with_initial_state() {
        let (addr, _matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        assert!(controller.is_connected());

        let mirror = controller.state();
        assert_eq!(mirror.inputs, Some(12));
        assert_eq!(mirror.outputs, Some(12));
        assert_eq!(mirror.route(0, 3), Some(3));
        assert_eq!(mirror.input_labels.get(&0).map(String::as_str), Some("Input 1"));
        assert_eq!(mirror.model_name.as_deref(), Some("Smart Videohub 12x12"));
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut opts = ControllerOptions::new(addr.ip().to_string(), addr.port());
        opts.connect_timeout = Duration::from_millis(500);
        let controller = VideohubController::new(opts);
        assert!(controller.connect().await.is_err());
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn optimistic_route_confirmed_by_broadcast() {
        let (addr, matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        let mut events = controller.subscribe();

        controller.set_route(0, 3, 7).unwrap();
        // the mirror is updated before the wire answers
        assert_eq!(controller.state().route(0, 3), Some(7));
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::RoutingChanged(c) if c[0].src == 7)
        })
        .await;

        // authoritative echo clears the pending record
        timeout(Duration::from_secs(5), async {
            while controller.state.pending_len() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending record should clear");
        assert_eq!(matrix.route(0, 3), Some(7));
        assert_eq!(controller.state().route(0, 3), Some(7));
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn nak_rolls_back_optimistic_route() {
        let (addr, matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        let mut events = controller.subscribe();

        controller.set_route(0, 3, 99).unwrap();
        assert_eq!(controller.state().route(0, 3), Some(99), "optimistic");

        // optimistic event, then the rollback event restoring 3
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::RoutingChanged(c) if c[0].src == 99)
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::RoutingChanged(c) if c[0].src == 3)
        })
        .await;
        assert_eq!(controller.state().route(0, 3), Some(3));
        assert_eq!(controller.state.pending_len(), 0);
        assert_eq!(matrix.route(0, 3), Some(3));
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn lock_write_and_view() {
        let (addr, matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        let mut events = controller.subscribe();

        controller.set_lock(0, LockOp::Own).unwrap();
        wait_for(&mut events, |e| matches!(e, EngineEvent::LocksChanged(_))).await;
        assert_eq!(controller.state().locks.get(&0), Some(&LockView::Owned));

        timeout(Duration::from_secs(5), async {
            while matrix.lock_owner(0).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server should apply the lock");
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn server_side_changes_reach_the_mirror() {
        let (addr, matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        let mut events = controller.subscribe();

        matrix.set_routes(
            &[RouteChange {
                level: 0,
                dest: 8,
                src: 1,
            }],
            PeerId::LOCAL,
        );
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::RoutingChanged(c) if c[0].dest == 8 && c[0].src == 1)
        })
        .await;
        assert_eq!(controller.state().route(0, 8), Some(1));
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn label_update_roundtrip() {
        let (addr, matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        let mut events = controller.subscribe();

        controller.set_input_label(2, "Replay").unwrap();
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::InputLabelsChanged(c) if c[0].text == "Replay")
        })
        .await;
        assert_eq!(matrix.snapshot(PeerId::LOCAL).input_labels[2], "Replay");
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_restart() {
        let (addr, _matrix, stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        let mut events = controller.subscribe();

        // kill the server; every peer gets dropped
        stop.send(true).unwrap();
        wait_for(&mut events, |e| matches!(e, EngineEvent::RouterDisconnected)).await;
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::RouterReconnecting(1))
        })
        .await;

        // bring a fresh frontend up on the same address
        let matrix = Arc::new(RoutingMatrix::new(MatrixConfig::default()));
        let (ui, _) = broadcast::channel(64);
        let frontend = Arc::new(VideohubFrontend::new(Arc::clone(&matrix), ui));
        let listener = TcpListener::bind(addr).await.unwrap();
        let (_stop2, shutdown) = watch::channel(false);
        tokio::spawn(frontend.serve(listener, shutdown));

        wait_for(&mut events, |e| matches!(e, EngineEvent::RouterConnected)).await;
        assert!(controller.is_connected());
        controller.disconnect().await;
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn writes_fail_when_disconnected() {
        let (addr, _matrix, _stop) = spawn_frontend().await;
        let controller = controller_for(addr);
        controller.connect().await.unwrap();
        controller.disconnect().await;
        assert!(controller.set_route(0, 0, 1).is_err());
    }
}
