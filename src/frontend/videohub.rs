//! Videohub server engine.
//!
//! Bridges TCP clients speaking the Videohub Ethernet Protocol to the
//! shared routing matrix. Clients get the full status dump on accept and
//! asynchronous section broadcasts afterwards; the lock section is
//! rendered per peer.

use crate::engine::EngineEvent;
use crate::matrix::{
    LabelChange, LockOp, LockView, MatrixEvent, MatrixSnapshot, PeerId, RouteChange, RoutingMatrix,
};
use anyhow::Result;
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use videohub::{
    DeviceInfo, Entries, HubCodec, HubMessage, Label, LockEntry, LockState, Preamble, Route,
    Setting,
};

pub const PROTOCOL_VERSION: &str = "2.7";

pub struct VideohubFrontend {
    matrix: Arc<RoutingMatrix>,
    ui: broadcast::Sender<EngineEvent>,
}

fn lock_state(view: LockView) -> LockState {
    match view {
        LockView::Owned => LockState::Owned,
        LockView::Locked => LockState::Locked,
        LockView::Unlocked => LockState::Unlocked,
    }
}

fn label_entries(labels: &[String]) -> Entries<Label> {
    labels
        .iter()
        .enumerate()
        .map(|(i, text)| Label {
            index: i as u16,
            text: text.clone(),
        })
        .collect::<Vec<_>>()
        .into()
}

fn routing_entries(snap: &MatrixSnapshot) -> Entries<Route> {
    snap.routes[0]
        .iter()
        .enumerate()
        .map(|(dest, src)| Route {
            dest: dest as u16,
            src: *src,
        })
        .collect::<Vec<_>>()
        .into()
}

fn lock_entries(snap: &MatrixSnapshot) -> Entries<LockEntry> {
    snap.locks
        .iter()
        .enumerate()
        .map(|(dest, view)| LockEntry {
            dest: dest as u16,
            state: lock_state(*view),
        })
        .collect::<Vec<_>>()
        .into()
}

impl VideohubFrontend {
    pub fn new(matrix: Arc<RoutingMatrix>, ui: broadcast::Sender<EngineEvent>) -> Self {
        Self { matrix, ui }
    }

    /// Accept connections until shutdown flips, then drain every
    /// connection task.
    #[tracing::instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut connections = JoinSet::new();
        loop {
            select! {
                accepted = listener.accept() => {
                    let (socket, peer_addr) = accepted?;
                    let peer = self.matrix.allocate_peer();
                    info!(%peer_addr, peer = peer.0, "videohub client connected");
                    let _ = self.ui.send(EngineEvent::ClientConnected(peer_addr.to_string()));
                    let this = Arc::clone(&self);
                    let conn_shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = this
                            .handle_connection(socket, peer_addr, peer, conn_shutdown)
                            .await
                        {
                            debug!(%peer_addr, error = %e, "connection ended");
                        }
                        // disconnect hook: frees the peer's locks and
                        // broadcasts the unlock delta
                        this.matrix.release_locks_of(peer);
                        info!(%peer_addr, "videohub client disconnected");
                        let _ = this.ui.send(EngineEvent::ClientDisconnected(peer_addr.to_string()));
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        drop(listener);
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    #[tracing::instrument(skip(self, socket, shutdown), fields(peer = %peer_addr))]
    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        peer: PeerId,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut framed = Framed::new(socket, HubCodec);
        // subscribe before the snapshot so no change between dump and
        // loop start is lost
        let mut events = self.matrix.subscribe();

        for msg in self.initial_dump(peer) {
            framed.send(msg).await?;
        }

        loop {
            select! {
                maybe = framed.next() => match maybe {
                    Some(Ok(msg)) => {
                        for reply in self.handle_message(msg, peer, peer_addr) {
                            framed.send(reply).await?;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%peer_addr, error = %e, "closing connection on codec error");
                        return Err(e.into());
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(ev) => {
                        if let Some(msg) = render_event(ev, peer) {
                            framed.send(msg).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%peer_addr, missed, "peer cannot keep up, disconnecting");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }

    /// The status dump pushed right after accept.
    fn initial_dump(&self, peer: PeerId) -> Vec<HubMessage> {
        let snap = self.matrix.snapshot(peer);
        vec![
            HubMessage::ProtocolPreamble(Preamble {
                version: PROTOCOL_VERSION.into(),
            }),
            HubMessage::DeviceInfo(DeviceInfo {
                present: Some(true),
                model_name: Some(snap.config.model_name.clone()),
                friendly_name: Some(snap.config.friendly_name.clone()),
                unique_id: Some(snap.config.unique_id.clone()),
                video_inputs: Some(snap.config.inputs),
                video_outputs: Some(snap.config.outputs),
            }),
            HubMessage::InputLabels(label_entries(&snap.input_labels)),
            HubMessage::OutputLabels(label_entries(&snap.output_labels)),
            HubMessage::OutputLocks(lock_entries(&snap)),
            HubMessage::OutputRouting(routing_entries(&snap)),
            HubMessage::Configuration(vec![Setting {
                name: "Take Mode".into(),
                value: "false".into(),
            }]),
            HubMessage::EndPrelude,
        ]
    }

    fn command_received(&self, peer_addr: SocketAddr, description: impl Into<String>) {
        let _ = self.ui.send(EngineEvent::CommandReceived {
            id: peer_addr.to_string(),
            description: description.into(),
        });
    }

    /// Decode one request block into the replies for the originator.
    /// Broadcasts ride the matrix event channel, not the return value.
    fn handle_message(
        &self,
        msg: HubMessage,
        peer: PeerId,
        peer_addr: SocketAddr,
    ) -> Vec<HubMessage> {
        match msg {
            HubMessage::Ping => {
                self.command_received(peer_addr, "PING");
                vec![HubMessage::Ack]
            }
            HubMessage::OutputRouting(body) => {
                if body.is_query() {
                    self.command_received(peer_addr, "VIDEO OUTPUT ROUTING query");
                    let snap = self.matrix.snapshot(peer);
                    return vec![HubMessage::Ack, HubMessage::OutputRouting(routing_entries(&snap))];
                }
                self.command_received(
                    peer_addr,
                    format!("VIDEO OUTPUT ROUTING update ({} entries)", body.entries.len()),
                );
                let changes: Vec<RouteChange> = body
                    .entries
                    .iter()
                    .map(|r| RouteChange {
                        level: 0,
                        dest: r.dest,
                        src: r.src,
                    })
                    .collect();
                let outcome = self.matrix.set_routes(&changes, peer);
                self.ack_or_nak(outcome.any_accepted())
            }
            HubMessage::OutputLocks(body) => {
                if body.is_query() {
                    self.command_received(peer_addr, "VIDEO OUTPUT LOCKS query");
                    let snap = self.matrix.snapshot(peer);
                    return vec![HubMessage::Ack, HubMessage::OutputLocks(lock_entries(&snap))];
                }
                self.command_received(
                    peer_addr,
                    format!("VIDEO OUTPUT LOCKS update ({} entries)", body.entries.len()),
                );
                let ops: Vec<(u16, LockOp)> = body
                    .entries
                    .iter()
                    .filter_map(|e| {
                        let op = match e.state {
                            LockState::Owned => LockOp::Own,
                            LockState::Unlocked => LockOp::Unlock,
                            LockState::ForceUnlock => LockOp::Force,
                            // `L` is a rendered state, never a request
                            LockState::Locked => return None,
                        };
                        Some((e.dest, op))
                    })
                    .collect();
                let outcome = self.matrix.set_locks(&ops, peer);
                self.ack_or_nak(outcome.any_accepted())
            }
            HubMessage::InputLabels(body) => {
                if body.is_query() {
                    self.command_received(peer_addr, "INPUT LABELS query");
                    let snap = self.matrix.snapshot(peer);
                    return vec![
                        HubMessage::Ack,
                        HubMessage::InputLabels(label_entries(&snap.input_labels)),
                    ];
                }
                self.command_received(
                    peer_addr,
                    format!("INPUT LABELS update ({} entries)", body.entries.len()),
                );
                let changes = label_changes(&body);
                let outcome = self.matrix.set_input_labels(&changes);
                self.ack_or_nak(outcome.any_accepted())
            }
            HubMessage::OutputLabels(body) => {
                if body.is_query() {
                    self.command_received(peer_addr, "OUTPUT LABELS query");
                    let snap = self.matrix.snapshot(peer);
                    return vec![
                        HubMessage::Ack,
                        HubMessage::OutputLabels(label_entries(&snap.output_labels)),
                    ];
                }
                self.command_received(
                    peer_addr,
                    format!("OUTPUT LABELS update ({} entries)", body.entries.len()),
                );
                let changes = label_changes(&body);
                let outcome = self.matrix.set_output_labels(&changes);
                self.ack_or_nak(outcome.any_accepted())
            }
            HubMessage::Unknown { header, .. } => {
                // unknown headers are ignored without a reply
                debug!(%peer_addr, %header, "ignoring unknown block");
                vec![]
            }
            // status blocks from a peer carry nothing for us
            _ => vec![],
        }
    }

    fn ack_or_nak(&self, accepted: bool) -> Vec<HubMessage> {
        if accepted {
            vec![HubMessage::Ack]
        } else {
            vec![HubMessage::Nak]
        }
    }
}

fn label_changes(body: &Entries<Label>) -> Vec<LabelChange> {
    body.entries
        .iter()
        .map(|l| LabelChange {
            index: l.index,
            text: l.text.clone(),
        })
        .collect()
}

/// Translate one matrix event into the block to push to `peer`.
fn render_event(event: MatrixEvent, peer: PeerId) -> Option<HubMessage> {
    match event {
        MatrixEvent::Routed(changes) => {
            let entries: Vec<Route> = changes
                .iter()
                .filter(|c| c.level == 0)
                .map(|c| Route {
                    dest: c.dest,
                    src: c.src,
                })
                .collect();
            (!entries.is_empty()).then(|| HubMessage::OutputRouting(entries.into()))
        }
        MatrixEvent::LocksChanged(changes) => {
            let entries: Vec<LockEntry> = changes
                .iter()
                .map(|c| LockEntry {
                    dest: c.dest,
                    state: lock_state(LockView::relative_to(c.owner, peer)),
                })
                .collect();
            Some(HubMessage::OutputLocks(entries.into()))
        }
        MatrixEvent::InputLabelsChanged(changes) => Some(HubMessage::InputLabels(
            changes
                .into_iter()
                .map(|c| Label {
                    index: c.index,
                    text: c.text,
                })
                .collect::<Vec<_>>()
                .into(),
        )),
        MatrixEvent::OutputLabelsChanged(changes) => Some(HubMessage::OutputLabels(
            changes
                .into_iter()
                .map(|c| Label {
                    index: c.index,
                    text: c.text,
                })
                .collect::<Vec<_>>()
                .into(),
        )),
        MatrixEvent::LevelNamesChanged(_) => None,
    }
}
