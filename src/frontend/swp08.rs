//! SW-P-08 server engine.
//!
//! Nothing is pushed on accept; controllers interrogate or request dumps.
//! Every structurally valid frame is answered with `DLE ACK` before any
//! payload replies; corrupt frames get `DLE NAK` and the connection
//! carries on. Crosspoint changes are notified to every peer as
//! Connected messages.

use crate::engine::EngineEvent;
use crate::matrix::{MatrixEvent, PeerId, RouteChange, RoutingMatrix};
use anyhow::Result;
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use swp08::{
    CharLen, Frame, Message, MatrixLevel, NamesBatch, Swp08Codec, MAX_STANDARD_ADDRESS,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Names per response message; keeps frames comfortably under the
/// transport's byte-count range.
const NAMES_PER_BATCH: usize = 16;

pub struct Swp08Frontend {
    matrix: Arc<RoutingMatrix>,
    ui: broadcast::Sender<EngineEvent>,
}

impl Swp08Frontend {
    pub fn new(matrix: Arc<RoutingMatrix>, ui: broadcast::Sender<EngineEvent>) -> Self {
        Self { matrix, ui }
    }

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
                    info!(%peer_addr, peer = peer.0, "sw-p-08 client connected");
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
                        info!(%peer_addr, "sw-p-08 client disconnected");
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
        let mut framed = Framed::new(socket, Swp08Codec);
        let mut events = self.matrix.subscribe();

        loop {
            select! {
                maybe = framed.next() => match maybe {
                    Some(Ok(Frame::Corrupt(e))) => {
                        warn!(%peer_addr, error = %e, "corrupt frame, sending NAK");
                        framed.send(Frame::Nak).await?;
                    }
                    Some(Ok(Frame::Ack | Frame::Nak)) => {}
                    Some(Ok(Frame::Msg(msg))) => {
                        framed.send(Frame::Ack).await?;
                        for reply in self.handle_message(msg, peer, peer_addr) {
                            framed.send(Frame::Msg(reply)).await?;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%peer_addr, error = %e, "closing connection on codec error");
                        return Err(e.into());
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(MatrixEvent::Routed(changes)) => {
                        for change in &changes {
                            if let Some(msg) = connected_for(change) {
                                framed.send(Frame::Msg(msg)).await?;
                            }
                        }
                    }
                    Ok(_) => {} // no async label or lock messages in this protocol
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

    fn command_received(&self, peer_addr: SocketAddr, description: impl Into<String>) {
        let _ = self.ui.send(EngineEvent::CommandReceived {
            id: peer_addr.to_string(),
            description: description.into(),
        });
    }

    fn handle_message(&self, msg: Message, peer: PeerId, peer_addr: SocketAddr) -> Vec<Message> {
        match msg {
            Message::Interrogate { ml, dest } => {
                self.command_received(peer_addr, format!("interrogate dest {dest}"));
                if ml.matrix != 0 {
                    return vec![];
                }
                match self.matrix.route(ml.level as u16, dest) {
                    Some(src) if src <= MAX_STANDARD_ADDRESS => {
                        vec![Message::Tally { ml, dest, src }]
                    }
                    _ => vec![],
                }
            }
            Message::Connect { ml, dest, src } => {
                self.command_received(peer_addr, format!("connect {src} -> {dest}"));
                if ml.matrix == 0 {
                    self.matrix.set_routes(
                        &[RouteChange {
                            level: ml.level as u16,
                            dest,
                            src,
                        }],
                        peer,
                    );
                }
                vec![]
            }
            Message::TallyDumpRequest { ml } => {
                self.command_received(peer_addr, format!("tally dump level {}", ml.level));
                if ml.matrix != 0 {
                    return vec![];
                }
                self.tally_dump(ml.level, false)
            }
            Message::SrcNamesRequest { matrix, len } => {
                self.command_received(peer_addr, "source names request");
                if matrix != 0 {
                    return vec![];
                }
                self.name_batches(matrix, len, true, false)
            }
            Message::DestNamesRequest { matrix, len } => {
                self.command_received(peer_addr, "destination names request");
                if matrix != 0 {
                    return vec![];
                }
                self.name_batches(matrix, len, false, false)
            }
            Message::InterrogateExt {
                matrix,
                level,
                dest,
            } => {
                self.command_received(peer_addr, format!("interrogate dest {dest} (extended)"));
                if matrix != 0 {
                    return vec![];
                }
                match self.matrix.route(level as u16, dest) {
                    Some(src) => vec![Message::TallyExt {
                        matrix,
                        level,
                        dest,
                        src,
                    }],
                    None => vec![],
                }
            }
            Message::ConnectExt {
                matrix,
                level,
                dest,
                src,
            } => {
                self.command_received(peer_addr, format!("connect {src} -> {dest} (extended)"));
                if matrix == 0 {
                    self.matrix.set_routes(
                        &[RouteChange {
                            level: level as u16,
                            dest,
                            src,
                        }],
                        peer,
                    );
                }
                vec![]
            }
            Message::TallyDumpRequestExt { matrix, level } => {
                self.command_received(peer_addr, format!("tally dump level {level} (extended)"));
                if matrix != 0 {
                    return vec![];
                }
                self.tally_dump(level, true)
            }
            Message::SrcNamesRequestExt { matrix, len } => {
                self.command_received(peer_addr, "source names request (extended)");
                if matrix != 0 {
                    return vec![];
                }
                self.name_batches(matrix, len, true, true)
            }
            Message::DestNamesRequestExt { matrix, len } => {
                self.command_received(peer_addr, "destination names request (extended)");
                if matrix != 0 {
                    return vec![];
                }
                self.name_batches(matrix, len, false, true)
            }
            Message::Unknown(data) => {
                debug!(%peer_addr, opcode = ?data.first(), "ignoring unknown opcode");
                vec![]
            }
            // tallies and name responses are things we emit, not consume
            _ => vec![],
        }
    }

    /// One tally per destination of `level`.
    fn tally_dump(&self, level: u8, extended: bool) -> Vec<Message> {
        let snap = self.matrix.snapshot(PeerId::LOCAL);
        let Some(routes) = snap.routes.get(level as usize) else {
            return vec![];
        };
        routes
            .iter()
            .enumerate()
            .filter_map(|(dest, src)| {
                let dest = dest as u16;
                if extended {
                    Some(Message::TallyExt {
                        matrix: 0,
                        level,
                        dest,
                        src: *src,
                    })
                } else if dest <= MAX_STANDARD_ADDRESS && *src <= MAX_STANDARD_ADDRESS {
                    Some(Message::Tally {
                        ml: MatrixLevel::level(level),
                        dest,
                        src: *src,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn name_batches(&self, matrix: u8, len: CharLen, sources: bool, extended: bool) -> Vec<Message> {
        let snap = self.matrix.snapshot(PeerId::LOCAL);
        let labels = if sources {
            &snap.input_labels
        } else {
            &snap.output_labels
        };
        labels
            .chunks(NAMES_PER_BATCH)
            .enumerate()
            .map(|(i, chunk)| {
                let batch = NamesBatch {
                    matrix,
                    len,
                    start: (i * NAMES_PER_BATCH) as u16,
                    names: chunk.to_vec(),
                };
                match (sources, extended) {
                    (true, false) => Message::SrcNamesResponse(batch),
                    (false, false) => Message::DestNamesResponse(batch),
                    (true, true) => Message::SrcNamesResponseExt(batch),
                    (false, true) => Message::DestNamesResponseExt(batch),
                }
            })
            .collect()
    }
}

fn connected_for(change: &RouteChange) -> Option<Message> {
    if change.level <= 0x0F
        && change.dest <= MAX_STANDARD_ADDRESS
        && change.src <= MAX_STANDARD_ADDRESS
    {
        Some(Message::Connected {
            ml: MatrixLevel::level(change.level as u8),
            dest: change.dest,
            src: change.src,
        })
    } else if change.level <= 0xFF {
        Some(Message::ConnectedExt {
            matrix: 0,
            level: change.level as u8,
            dest: change.dest,
            src: change.src,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MatrixConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Duration};

    async fn start_frontend(
        config: MatrixConfig,
    ) -> (SocketAddr, Arc<RoutingMatrix>, watch::Sender<bool>) {
        let matrix = Arc::new(RoutingMatrix::new(config));
        let (ui, _) = broadcast::channel(64);
        let frontend = Arc::new(Swp08Frontend::new(Arc::clone(&matrix), ui));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(frontend.serve(listener, shutdown));
        (addr, matrix, stop)
    }

    async fn next_frame(framed: &mut Framed<TcpStream, Swp08Codec>) -> Frame {
        timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("timed out waiting for frame")
            .expect("peer closed")
            .expect("codec error")
    }

    #[tokio::test]
    async fn crosspoint_connect_scenario_bytes() {
        let (addr, matrix, _stop) = start_frontend(MatrixConfig::default()).await;
        let mut sender = TcpStream::connect(addr).await.unwrap();
        let mut observer = Framed::new(TcpStream::connect(addr).await.unwrap(), Swp08Codec);

        // make sure the observer's connection task is live (and thus
        // subscribed) before the route lands
        observer
            .send(Frame::Msg(Message::Interrogate {
                ml: MatrixLevel::level(0),
                dest: 0,
            }))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut observer).await, Frame::Ack);
        assert!(matches!(
            next_frame(&mut observer).await,
            Frame::Msg(Message::Tally { .. })
        ));

        // CMD=0x02 matrix/level=0x00 multiplier=0x00 dest=0x03 src=0x07
        sender
            .write_all(&[0x10, 0x02, 0x02, 0x00, 0x00, 0x03, 0x07, 0x09, 0xEB, 0x10, 0x03])
            .await
            .unwrap();

        // transport ACK comes back first
        let mut ack = [0u8; 2];
        timeout(Duration::from_secs(5), sender.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack, [0x10, 0x06]);

        assert_eq!(matrix.route(0, 3), Some(7));

        // all peers get the Connected notification
        let frame = next_frame(&mut observer).await;
        assert_eq!(
            frame,
            Frame::Msg(Message::Connected {
                ml: MatrixLevel::level(0),
                dest: 3,
                src: 7,
            })
        );
    }

    #[tokio::test]
    async fn bad_checksum_naks_and_connection_survives() {
        let (addr, matrix, _stop) = start_frontend(MatrixConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut corrupted = vec![0x10, 0x02, 0x02, 0x00, 0x00, 0x03, 0x07, 0x09, 0xAA, 0x10, 0x03];
        stream.write_all(&corrupted).await.unwrap();
        let mut nak = [0u8; 2];
        timeout(Duration::from_secs(5), stream.read_exact(&mut nak))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nak, [0x10, 0x15]);
        assert_eq!(matrix.route(0, 3), Some(3), "corrupt frame must not route");

        // the same frame with the right checksum still works afterwards
        corrupted[8] = 0xEB;
        stream.write_all(&corrupted).await.unwrap();
        let mut ack = [0u8; 2];
        timeout(Duration::from_secs(5), stream.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack, [0x10, 0x06]);
        assert_eq!(matrix.route(0, 3), Some(7));
    }

    #[tokio::test]
    async fn interrogate_returns_tally() {
        let (addr, matrix, _stop) = start_frontend(MatrixConfig::default()).await;
        matrix.set_routes(
            &[RouteChange {
                level: 0,
                dest: 5,
                src: 9,
            }],
            PeerId::LOCAL,
        );
        let mut framed = Framed::new(TcpStream::connect(addr).await.unwrap(), Swp08Codec);

        framed
            .send(Frame::Msg(Message::Interrogate {
                ml: MatrixLevel::level(0),
                dest: 5,
            }))
            .await
            .unwrap();

        assert_eq!(next_frame(&mut framed).await, Frame::Ack);
        assert_eq!(
            next_frame(&mut framed).await,
            Frame::Msg(Message::Tally {
                ml: MatrixLevel::level(0),
                dest: 5,
                src: 9,
            })
        );
    }

    #[tokio::test]
    async fn tally_dump_streams_every_destination() {
        let (addr, _matrix, _stop) = start_frontend(MatrixConfig::default()).await;
        let mut framed = Framed::new(TcpStream::connect(addr).await.unwrap(), Swp08Codec);

        framed
            .send(Frame::Msg(Message::TallyDumpRequest {
                ml: MatrixLevel::level(0),
            }))
            .await
            .unwrap();

        assert_eq!(next_frame(&mut framed).await, Frame::Ack);
        for dest in 0..12u16 {
            assert_eq!(
                next_frame(&mut framed).await,
                Frame::Msg(Message::Tally {
                    ml: MatrixLevel::level(0),
                    dest,
                    src: dest,
                })
            );
        }
    }

    #[tokio::test]
    async fn name_request_batches_fixed_width() {
        let (addr, _matrix, _stop) = start_frontend(MatrixConfig {
            inputs: 20,
            outputs: 20,
            ..MatrixConfig::default()
        })
        .await;
        let mut framed = Framed::new(TcpStream::connect(addr).await.unwrap(), Swp08Codec);

        framed
            .send(Frame::Msg(Message::SrcNamesRequest {
                matrix: 0,
                len: CharLen::Eight,
            }))
            .await
            .unwrap();

        assert_eq!(next_frame(&mut framed).await, Frame::Ack);
        let first = next_frame(&mut framed).await;
        let second = next_frame(&mut framed).await;
        match (first, second) {
            (Frame::Msg(Message::SrcNamesResponse(a)), Frame::Msg(Message::SrcNamesResponse(b))) => {
                assert_eq!(a.start, 0);
                assert_eq!(a.names.len(), 16);
                assert_eq!(a.names[0], "Input 1");
                assert_eq!(b.start, 16);
                assert_eq!(b.names.len(), 4);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[tokio::test]
    async fn extended_connect_on_multi_level_matrix() {
        let (addr, matrix, _stop) = start_frontend(MatrixConfig {
            levels: 3,
            ..MatrixConfig::default()
        })
        .await;
        let mut framed = Framed::new(TcpStream::connect(addr).await.unwrap(), Swp08Codec);

        framed
            .send(Frame::Msg(Message::ConnectExt {
                matrix: 0,
                level: 2,
                dest: 4,
                src: 11,
            }))
            .await
            .unwrap();

        assert_eq!(next_frame(&mut framed).await, Frame::Ack);
        // the notification for our own change comes back too
        assert_eq!(
            next_frame(&mut framed).await,
            Frame::Msg(Message::Connected {
                ml: MatrixLevel::level(2),
                dest: 4,
                src: 11,
            })
        );
        assert_eq!(matrix.route(2, 4), Some(11));
    }
}
