//! Grass Valley Native controller.
//!
//! On connect it walks the discovery sequence (`BK,N`, `BK,d`, `QN,IS`,
//! `QN,ID`, `QN,L`, `QJ`), then polls `BK,F` for change flags; a set flag
//! re-queries just the affected section and is cleared with `BK,f`. An
//! `ER` with a non-zero code is the protocol's NAK and rolls back every
//! pending route.

use super::{not_connected, Backoff, ClientState, ControllerOptions, Mirror, PendingKind};
use crate::engine::EngineEvent;
use anyhow::{anyhow, Result};
use futures_core::stream::BoxStream;
use futures_util::SinkExt;
use gvnative::{hex4, parse_hex4, Frame, GvCodec, GvItem};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type GvFramed = Framed<TcpStream, GvCodec>;

const FLAG_ROUTING: u8 = 0x01;
const FLAG_SRC_NAMES: u8 = 0x02;
const FLAG_DEST_NAMES: u8 = 0x04;
const FLAG_LEVEL_NAMES: u8 = 0x08;

#[derive(Default)]
struct Session {
    cmd_tx: Option<mpsc::UnboundedSender<Frame>>,
    task: Option<JoinHandle<()>>,
}

pub struct GvNativeController {
    opts: ControllerOptions,
    state: Arc<ClientState>,
    session: Mutex<Session>,
    cancel: watch::Sender<bool>,
}

impl GvNativeController {
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
        info!("native controller disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Optimistic crosspoint write via `TI`.
    pub fn set_route(&self, level: u16, dest: u16, src: u16) -> Result<()> {
        if !self.state.is_connected() {
            return Err(not_connected());
        }
        self.state.optimistic_route(level, dest, src);
        let take = Frame::new("TI", vec![hex4(dest), hex4(src), hex4(level)]);
        if let Err(e) = self.send(take) {
            self.state.rollback(PendingKind::Route);
            return Err(e);
        }
        Ok(())
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

    fn send(&self, frame: Frame) -> Result<()> {
        let session = self.session.lock().unwrap();
        let tx = session.cmd_tx.as_ref().ok_or_else(not_connected)?;
        tx.send(frame).map_err(|_| not_connected())
    }
}

fn discovery_sequence() -> Vec<Frame> {
    vec![
        Frame::new("BK", vec!["N".into()]),
        Frame::new("BK", vec!["d".into()]),
        Frame::new("QN", vec!["IS".into()]),
        Frame::new("QN", vec!["ID".into()]),
        Frame::new("QN", vec!["L".into()]),
        Frame::new("QJ", vec![]),
    ]
}

async fn establish(opts: &ControllerOptions, state: &Arc<ClientState>) -> Result<GvFramed> {
    let stream = timeout(
        opts.connect_timeout,
        TcpStream::connect((opts.host.as_str(), opts.port)),
    )
    .await
    .map_err(|_| anyhow!("connect to {}:{} timed out", opts.host, opts.port))??;
    let mut framed = Framed::new(stream, GvCodec);

    for query in discovery_sequence() {
        framed.send(query).await?;
    }

    timeout(opts.connect_timeout, async {
        while !state.has_initial_state() {
            let item = framed
                .next()
                .await
                .ok_or_else(|| anyhow!("EOF during discovery"))??;
            for reply in absorb(state, item) {
                framed.send(reply).await?;
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for initial state"))??;

    state.set_connected(true);
    state.emit(EngineEvent::RouterConnected);
    info!(host = %opts.host, port = opts.port, "native controller connected");
    Ok(framed)
}

async fn run(
    opts: ControllerOptions,
    state: Arc<ClientState>,
    mut framed: GvFramed,
    mut cmd_rx: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        session(&opts, &state, &mut framed, &mut cmd_rx).await;
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

async fn session(
    opts: &ControllerOptions,
    state: &Arc<ClientState>,
    framed: &mut GvFramed,
    cmd_rx: &mut mpsc::UnboundedReceiver<Frame>,
) {
    let mut poll = interval(opts.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(frame) => {
                    if framed.send(frame).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = poll.tick() => {
                if framed.send(Frame::new("BK", vec!["F".into()])).await.is_err() {
                    return;
                }
            }
            maybe = framed.next() => match maybe {
                Some(Ok(item)) => {
                    for reply in absorb(state, item) {
                        if framed.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    state.emit(EngineEvent::Error(format!("native stream error: {e}")));
                    return;
                }
                None => return,
            },
        }
    }
}

/// Fold one received frame into the mirror; returns follow-up requests
/// (section re-queries and flag clears).
fn absorb(state: &Arc<ClientState>, item: GvItem) -> Vec<Frame> {
    let frame = match item {
        GvItem::Frame(frame) => frame,
        GvItem::Corrupt(e) => {
            warn!(error = %e, "dropping unusable frame from router");
            return vec![];
        }
    };
    if !frame.checksum_ok {
        warn!(command = %frame.command, "checksum mismatch from router");
    }
    let params = &frame.params;

    match frame.command.as_str() {
        "BK" => match params.first().map(String::as_str) {
            Some("N") => {
                state.set_identity(None, params.get(1).cloned());
                vec![]
            }
            Some("I") => {
                state.set_identity(params.get(1).cloned(), None);
                vec![]
            }
            Some("d") => {
                let dests = params.get(1).and_then(|p| parse_hex4(p));
                let srcs = params.get(2).and_then(|p| parse_hex4(p));
                let levels = params.get(3).and_then(|p| parse_hex4(p));
                if let (Some(dests), Some(srcs)) = (dests, srcs) {
                    state.set_counts(srcs, dests);
                }
                if let Some(levels) = levels {
                    state.set_levels(levels);
                }
                vec![]
            }
            Some("F") => {
                let flags = params
                    .get(1)
                    .and_then(|p| u8::from_str_radix(p, 16).ok())
                    .unwrap_or(0);
                requeries_for(flags)
            }
            _ => vec![],
        },
        "NQ" => {
            match params.first().map(String::as_str) {
                Some("IS") => {
                    for param in &params[1..] {
                        if let Some((index, name)) = parse_indexed_name(param) {
                            state.absorb_input_label(index, name);
                        }
                    }
                }
                Some("ID") => {
                    for param in &params[1..] {
                        if let Some((index, name)) = parse_indexed_name(param) {
                            state.absorb_output_label(index, name);
                        }
                    }
                }
                Some("L") => {
                    for (i, name) in params[1..].iter().enumerate() {
                        state.absorb_level_name(i as u16, name.trim_end());
                    }
                }
                _ => {}
            }
            vec![]
        }
        "JQ" | "IQ" | "AT" => {
            for param in params {
                if let Some((dest, level, src)) = parse_status(param) {
                    state.authoritative_route(level, dest, src);
                }
            }
            vec![]
        }
        "ER" => {
            let code = params.first().map(String::as_str).unwrap_or("00");
            if code != "00" {
                let context = params.get(1).map(String::as_str).unwrap_or("");
                warn!(code, context, "router reported an error, rolling back");
                state.emit(EngineEvent::Error(format!(
                    "router error {code} on {context}"
                )));
                state.rollback(PendingKind::Route);
            }
            vec![]
        }
        other => {
            debug!(command = %other, "ignoring frame");
            vec![]
        }
    }
}

fn requeries_for(flags: u8) -> Vec<Frame> {
    if flags == 0 {
        return vec![];
    }
    let mut queries = Vec::new();
    if flags & FLAG_ROUTING != 0 {
        queries.push(Frame::new("QJ", vec![]));
    }
    if flags & FLAG_SRC_NAMES != 0 {
        queries.push(Frame::new("QN", vec!["IS".into()]));
    }
    if flags & FLAG_DEST_NAMES != 0 {
        queries.push(Frame::new("QN", vec!["ID".into()]));
    }
    if flags & FLAG_LEVEL_NAMES != 0 {
        queries.push(Frame::new("QN", vec!["L".into()]));
    }
    queries.push(Frame::new("BK", vec!["f".into()]));
    queries
}

fn parse_status(param: &str) -> Option<(u16, u16, u16)> {
    let mut parts = param.split(',');
    let dest = parse_hex4(parts.next()?)?;
    let level = parse_hex4(parts.next()?)?;
    let src = parse_hex4(parts.next()?)?;
    Some((dest, level, src))
}

fn parse_indexed_name(param: &str) -> Option<(u16, &str)> {
    let (index, name) = param.split_once(',')?;
    Some((parse_hex4(index)?, name.trim_end()))
}
