//! SW-P-08 controller.
//!
//! The protocol cannot report matrix dimensions, so they come from
//! [`ControllerOptions`]; on connect the controller requests a tally dump
//! per level plus the name tables, and `connect()` resolves when the
//! first tally lands. A transport `DLE NAK` is the only negative signal
//! and rolls back every pending route.

use super::{not_connected, Backoff, ClientState, ControllerOptions, Mirror, PendingKind};
use crate::engine::EngineEvent;
use anyhow::{anyhow, Result};
use futures_core::stream::BoxStream;
use futures_util::SinkExt;
use std::sync::{Arc, Mutex};
use swp08::{CharLen, Frame, Message, MatrixLevel, Swp08Codec, MAX_STANDARD_ADDRESS};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type SwFramed = Framed<TcpStream, Swp08Codec>;

#[derive(Default)]
struct Session {
    cmd_tx: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

pub struct Swp08Controller {
    opts: ControllerOptions,
    state: Arc<ClientState>,
    session: Mutex<Session>,
    cancel: watch::Sender<bool>,
}

impl Swp08Controller {
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
        if self.opts.inputs == 0 || self.opts.outputs == 0 {
            return Err(anyhow!(
                "sw-p-08 cannot discover matrix dimensions; configure inputs and outputs"
            ));
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
        info!("sw-p-08 controller disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Optimistic crosspoint write. Standard addressing when it fits,
    /// extended otherwise.
    pub fn set_route(&self, level: u16, dest: u16, src: u16) -> Result<()> {
        if !self.state.is_connected() {
            return Err(not_connected());
        }
        let msg = connect_message(level, dest, src)?;
        self.state.optimistic_route(level, dest, src);
        if let Err(e) = self.send(msg) {
            self.state.rollback(PendingKind::Route);
            return Err(e);
        }
        Ok(())
    }

    /// Ask for one crosspoint to be re-tallied.
    pub fn interrogate(&self, level: u16, dest: u16) -> Result<()> {
        if dest <= MAX_STANDARD_ADDRESS && level <= 0x0F {
            self.send(Message::Interrogate {
                ml: MatrixLevel::level(level as u8),
                dest,
            })
        } else {
            self.send(Message::InterrogateExt {
                matrix: 0,
                level: level as u8,
                dest,
            })
        }
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

    fn send(&self, msg: Message) -> Result<()> {
        let session = self.session.lock().unwrap();
        let tx = session.cmd_tx.as_ref().ok_or_else(not_connected)?;
        tx.send(msg).map_err(|_| not_connected())
    }
}

fn connect_message(level: u16, dest: u16, src: u16) -> Result<Message> {
    if level <= 0x0F && dest <= MAX_STANDARD_ADDRESS && src <= MAX_STANDARD_ADDRESS {
        Ok(Message::Connect {
            ml: MatrixLevel::level(level as u8),
            dest,
            src,
        })
    } else if level <= 0xFF {
        Ok(Message::ConnectExt {
            matrix: 0,
            level: level as u8,
            dest,
            src,
        })
    } else {
        Err(anyhow!("level {level} not addressable"))
    }
}

/// The query burst that resynchronizes the mirror.
fn resync_queries(opts: &ControllerOptions) -> Vec<Message> {
    let extended = opts.inputs > MAX_STANDARD_ADDRESS + 1 || opts.outputs > MAX_STANDARD_ADDRESS + 1;
    let mut queries = Vec::new();
    for level in 0..opts.levels {
        if extended || level > 0x0F {
            queries.push(Message::TallyDumpRequestExt {
                matrix: 0,
                level: level as u8,
            });
        } else {
            queries.push(Message::TallyDumpRequest {
                ml: MatrixLevel::level(level as u8),
            });
        }
    }
    if extended {
        queries.push(Message::SrcNamesRequestExt {
            matrix: 0,
            len: CharLen::Eight,
        });
        queries.push(Message::DestNamesRequestExt {
            matrix: 0,
            len: CharLen::Eight,
        });
    } else {
        queries.push(Message::SrcNamesRequest {
            matrix: 0,
            len: CharLen::Eight,
        });
        queries.push(Message::DestNamesRequest {
            matrix: 0,
            len: CharLen::Eight,
        });
    }
    queries
}

async fn establish(opts: &ControllerOptions, state: &Arc<ClientState>) -> Result<SwFramed> {
    let stream = timeout(
        opts.connect_timeout,
        TcpStream::connect((opts.host.as_str(), opts.port)),
    )
    .await
    .map_err(|_| anyhow!("connect to {}:{} timed out", opts.host, opts.port))??;
    let mut framed = Framed::new(stream, Swp08Codec);

    state.set_counts(opts.inputs, opts.outputs);
    state.set_levels(opts.levels);
    for query in resync_queries(opts) {
        framed.send(Frame::Msg(query)).await?;
    }

    timeout(opts.connect_timeout, async {
        while !state.has_initial_state() {
            let item = framed
                .next()
                .await
                .ok_or_else(|| anyhow!("EOF during resynchronization"))??;
            absorb(state, item);
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for initial state"))??;

    state.set_connected(true);
    state.emit(EngineEvent::RouterConnected);
    info!(host = %opts.host, port = opts.port, "sw-p-08 controller connected");
    Ok(framed)
}

async fn run(
    opts: ControllerOptions,
    state: Arc<ClientState>,
    mut framed: SwFramed,
    mut cmd_rx: mpsc::UnboundedReceiver<Message>,
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

async fn session(
    state: &Arc<ClientState>,
    framed: &mut SwFramed,
    cmd_rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    loop {
        select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(msg) => {
                    if framed.send(Frame::Msg(msg)).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            maybe = framed.next() => match maybe {
                Some(Ok(Frame::Corrupt(e))) => {
                    warn!(error = %e, "corrupt frame from router, sending NAK");
                    if framed.send(Frame::Nak).await.is_err() {
                        return;
                    }
                }
                Some(Ok(item)) => absorb(state, item),
                Some(Err(e)) => {
                    state.emit(EngineEvent::Error(format!("sw-p-08 stream error: {e}")));
                    return;
                }
                None => return,
            },
        }
    }
}

fn absorb(state: &Arc<ClientState>, item: Frame) {
    match item {
        // transport ack for our last command; broadcasts confirm writes
        Frame::Ack => {}
        Frame::Nak => {
            warn!("router rejected a frame, rolling back pending routes");
            state.rollback(PendingKind::Route);
        }
        Frame::Corrupt(e) => {
            warn!(error = %e, "corrupt frame from router");
        }
        Frame::Msg(msg) => match msg {
            Message::Tally { ml, dest, src } | Message::Connected { ml, dest, src } => {
                state.authoritative_route(ml.level as u16, dest, src);
            }
            Message::TallyExt {
                level, dest, src, ..
            }
            | Message::ConnectedExt {
                level, dest, src, ..
            } => {
                state.authoritative_route(level as u16, dest, src);
            }
            Message::SrcNamesResponse(batch) | Message::SrcNamesResponseExt(batch) => {
                for (i, name) in batch.names.iter().enumerate() {
                    state.absorb_input_label(batch.start + i as u16, name);
                }
            }
            Message::DestNamesResponse(batch) | Message::DestNamesResponseExt(batch) => {
                for (i, name) in batch.names.iter().enumerate() {
                    state.absorb_output_label(batch.start + i as u16, name);
                }
            }
            other => {
                debug!(opcode = other.opcode(), "ignoring message");
            }
        },
    }
}
