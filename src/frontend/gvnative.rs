//! Grass Valley Native server engine.
//!
//! Nothing is pushed on accept. Controllers discover the router through
//! `BK` background queries and `QN`/`QJ` name and status queries, then
//! either poll `BK,F` change flags or enable asynchronous `AT` take
//! notifications with `BK,A`. Echo mode (default on) appends `ER,00,<cc>`
//! to bulk queries and takes; lower-case query variants are quiet.

use crate::engine::EngineEvent;
use crate::matrix::{MatrixEvent, PeerId, RouteChange, RoutingMatrix};
use anyhow::Result;
use chrono::Local;
use futures_util::SinkExt;
use gvnative::{fit_name, hex4, parse_hex4, Frame, GvCodec, GvItem, LevelBitmap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const ERR_OK: &str = "00";
const ERR_SYNTAX: &str = "01";
const ERR_RANGE: &str = "02";
const ERR_NAME: &str = "03";

/// Change-flag bits reported by `BK,F`.
const FLAG_ROUTING: u8 = 0x01;
const FLAG_SRC_NAMES: u8 = 0x02;
const FLAG_DEST_NAMES: u8 = 0x04;
const FLAG_LEVEL_NAMES: u8 = 0x08;

/// Retained error-table entries per connection.
const ERROR_TABLE_DEPTH: usize = 16;

/// Per-connection protocol state.
struct ConnState {
    echo: bool,
    async_takes: bool,
    flags: u8,
    errors: Vec<(String, String)>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            echo: true,
            async_takes: false,
            flags: 0,
            errors: Vec::new(),
        }
    }

    fn record_error(&mut self, code: &str, text: impl Into<String>) {
        if self.errors.len() == ERROR_TABLE_DEPTH {
            self.errors.remove(0);
        }
        self.errors.push((code.into(), text.into()));
    }
}

fn er(code: &str, context: &str) -> Frame {
    Frame::new("ER", vec![code.into(), context.into()])
}

fn status_param(change: &RouteChange) -> String {
    format!(
        "{},{},{}",
        hex4(change.dest),
        hex4(change.level),
        hex4(change.src)
    )
}

pub struct GvNativeFrontend {
    matrix: Arc<RoutingMatrix>,
    ui: broadcast::Sender<EngineEvent>,
}

impl GvNativeFrontend {
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
                    info!(%peer_addr, peer = peer.0, "native client connected");
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
                        info!(%peer_addr, "native client disconnected");
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
        let mut framed = Framed::new(socket, GvCodec);
        let mut events = self.matrix.subscribe();
        let mut state = ConnState::new();

        loop {
            select! {
                maybe = framed.next() => match maybe {
                    Some(Ok(GvItem::Frame(frame))) => {
                        if !frame.checksum_ok {
                            // tolerated: dispatch anyway, like the real
                            // control surface
                            warn!(%peer_addr, command = %frame.command, "checksum mismatch");
                        }
                        for reply in self.handle_frame(frame, &mut state, peer, peer_addr) {
                            framed.send(reply).await?;
                        }
                    }
                    Some(Ok(GvItem::Corrupt(e))) => {
                        warn!(%peer_addr, error = %e, "dropping unusable frame");
                    }
                    Some(Err(e)) => {
                        warn!(%peer_addr, error = %e, "closing connection on io error");
                        return Err(e.into());
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(ev) => {
                        for frame in apply_event(&mut state, ev) {
                            framed.send(frame).await?;
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

    fn command_received(&self, peer_addr: SocketAddr, description: impl Into<String>) {
        let _ = self.ui.send(EngineEvent::CommandReceived {
            id: peer_addr.to_string(),
            description: description.into(),
        });
    }

    fn handle_frame(
        &self,
        frame: Frame,
        state: &mut ConnState,
        peer: PeerId,
        peer_addr: SocketAddr,
    ) -> Vec<Frame> {
        let command = frame.command.clone();
        self.command_received(peer_addr, command.clone());
        let quiet = command.chars().nth(1).is_some_and(|c| c.is_lowercase());
        let echo = state.echo && !quiet;
        let params = &frame.params;

        match command.as_str() {
            "QN" => self.query_names(params, state, echo),
            "QD" | "Qd" => self.dest_status_by_name(params, state, echo),
            "QJ" | "Qj" => self.dest_status_bulk(params, state, echo, &command),
            "QI" | "Qi" => self.dest_status_single(params, state, echo, &command),
            "TA" => {
                let levels = LevelBitmap::all(self.matrix.config().levels);
                self.take_by_name(params, levels, state, echo, peer, "TA")
            }
            "TD" => {
                let Some(levels) = params.get(2).and_then(|p| LevelBitmap::from_hex(p)) else {
                    state.record_error(ERR_SYNTAX, "TD: bad level bitmap");
                    return vec![er(ERR_SYNTAX, "TD")];
                };
                self.take_by_name(params, levels, state, echo, peer, "TD")
            }
            "TI" => {
                let (Some(dest), Some(src), Some(level)) = (
                    params.first().and_then(|p| parse_hex4(p)),
                    params.get(1).and_then(|p| parse_hex4(p)),
                    params.get(2).and_then(|p| parse_hex4(p)),
                ) else {
                    state.record_error(ERR_SYNTAX, "TI: bad parameters");
                    return vec![er(ERR_SYNTAX, "TI")];
                };
                self.take(dest, src, [level].into_iter(), state, echo, peer, "TI")
            }
            "TJ" => {
                let (Some(dest), Some(src), Some(levels)) = (
                    params.first().and_then(|p| parse_hex4(p)),
                    params.get(1).and_then(|p| parse_hex4(p)),
                    params.get(2).and_then(|p| LevelBitmap::from_hex(p)),
                ) else {
                    state.record_error(ERR_SYNTAX, "TJ: bad parameters");
                    return vec![er(ERR_SYNTAX, "TJ")];
                };
                self.take(
                    dest,
                    src,
                    levels.levels().map(u16::from),
                    state,
                    echo,
                    peer,
                    "TJ",
                )
            }
            "BK" => self.background(params, state),
            "QE" => {
                let mut reply = Frame::new("EQ", vec![]);
                reply.params = state
                    .errors
                    .iter()
                    .map(|(code, text)| format!("{},{}", code, text))
                    .collect();
                let mut out = vec![reply];
                if echo {
                    out.push(er(ERR_OK, "QE"));
                }
                out
            }
            "QT" => {
                let now = Local::now().format("%H:%M:%S").to_string();
                let mut out = vec![Frame::new("TQ", vec![now])];
                if echo {
                    out.push(er(ERR_OK, "QT"));
                }
                out
            }
            other => {
                state.record_error(ERR_SYNTAX, format!("unknown command {}", other));
                vec![er(ERR_SYNTAX, other)]
            }
        }
    }

    fn query_names(&self, params: &[String], state: &mut ConnState, echo: bool) -> Vec<Frame> {
        let snap = self.matrix.snapshot(PeerId::LOCAL);
        let Some(subtype) = params.first() else {
            state.record_error(ERR_SYNTAX, "QN: missing sub-type");
            return vec![er(ERR_SYNTAX, "QN")];
        };

        let indexed = |labels: &[String]| -> Vec<String> {
            labels
                .iter()
                .enumerate()
                .map(|(i, name)| format!("{},{}", hex4(i as u16), fit_name(name)))
                .collect()
        };
        let padded = |labels: &[String]| -> Vec<String> {
            labels.iter().map(|n| fit_name(n)).collect()
        };

        let names = match subtype.as_str() {
            "S" => padded(&snap.input_labels),
            "D" => padded(&snap.output_labels),
            "L" => padded(&snap.level_names),
            "IS" => indexed(&snap.input_labels),
            "ID" => indexed(&snap.output_labels),
            "XS" => snap.input_labels.clone(),
            "XD" => snap.output_labels.clone(),
            "XL" => snap.level_names.clone(),
            other => {
                state.record_error(ERR_SYNTAX, format!("QN: unknown sub-type {}", other));
                return vec![er(ERR_SYNTAX, "QN")];
            }
        };

        let mut reply_params = vec![subtype.clone()];
        reply_params.extend(names);
        let mut out = vec![Frame::new("NQ", reply_params)];
        if echo {
            out.push(er(ERR_OK, "QN"));
        }
        out
    }

    fn dest_status_by_name(
        &self,
        params: &[String],
        state: &mut ConnState,
        echo: bool,
    ) -> Vec<Frame> {
        let snap = self.matrix.snapshot(PeerId::LOCAL);
        let Some(wanted) = params.first() else {
            state.record_error(ERR_SYNTAX, "QD: missing destination name");
            return vec![er(ERR_SYNTAX, "QD")];
        };
        let Some(dest) = find_by_name(&snap.output_labels, wanted) else {
            state.record_error(ERR_NAME, format!("QD: unknown destination {}", wanted.trim()));
            return vec![er(ERR_NAME, "QD")];
        };

        let mut reply_params = vec![fit_name(&snap.output_labels[dest])];
        for level in &snap.routes {
            let src = level[dest] as usize;
            reply_params.push(fit_name(
                snap.input_labels.get(src).map(String::as_str).unwrap_or(""),
            ));
        }
        let mut out = vec![Frame::new("DQ", reply_params)];
        if echo {
            out.push(er(ERR_OK, "QD"));
        }
        out
    }

    fn dest_status_bulk(
        &self,
        params: &[String],
        state: &mut ConnState,
        echo: bool,
        cc: &str,
    ) -> Vec<Frame> {
        let snap = self.matrix.snapshot(PeerId::LOCAL);
        let outputs = snap.config.outputs;
        let start = match params.first() {
            Some(p) => match parse_hex4(p) {
                Some(v) => v,
                None => {
                    state.record_error(ERR_SYNTAX, "QJ: bad start index");
                    return vec![er(ERR_SYNTAX, cc)];
                }
            },
            None => 0,
        };
        let count = params
            .get(1)
            .and_then(|p| parse_hex4(p))
            .unwrap_or(outputs.saturating_sub(start));

        let mut entries = Vec::new();
        for dest in start..outputs.min(start.saturating_add(count)) {
            for (level, routes) in snap.routes.iter().enumerate() {
                entries.push(status_param(&RouteChange {
                    level: level as u16,
                    dest,
                    src: routes[dest as usize],
                }));
            }
        }
        let mut out = vec![Frame::new("JQ", entries)];
        if echo {
            out.push(er(ERR_OK, cc));
        }
        out
    }

    fn dest_status_single(
        &self,
        params: &[String],
        state: &mut ConnState,
        echo: bool,
        cc: &str,
    ) -> Vec<Frame> {
        let (Some(dest), Some(level)) = (
            params.first().and_then(|p| parse_hex4(p)),
            params.get(1).and_then(|p| parse_hex4(p)),
        ) else {
            state.record_error(ERR_SYNTAX, "QI: bad parameters");
            return vec![er(ERR_SYNTAX, cc)];
        };
        let Some(src) = self.matrix.route(level, dest) else {
            state.record_error(ERR_RANGE, "QI: index out of range");
            return vec![er(ERR_RANGE, cc)];
        };
        let mut out = vec![Frame::new(
            "IQ",
            vec![status_param(&RouteChange { level, dest, src })],
        )];
        if echo {
            out.push(er(ERR_OK, cc));
        }
        out
    }

    fn take_by_name(
        &self,
        params: &[String],
        levels: LevelBitmap,
        state: &mut ConnState,
        echo: bool,
        peer: PeerId,
        cc: &str,
    ) -> Vec<Frame> {
        let snap = self.matrix.snapshot(PeerId::LOCAL);
        let (Some(dest_name), Some(src_name)) = (params.first(), params.get(1)) else {
            state.record_error(ERR_SYNTAX, format!("{}: missing names", cc));
            return vec![er(ERR_SYNTAX, cc)];
        };
        let Some(dest) = find_by_name(&snap.output_labels, dest_name) else {
            state.record_error(ERR_NAME, format!("{}: unknown destination", cc));
            return vec![er(ERR_NAME, cc)];
        };
        let Some(src) = find_by_name(&snap.input_labels, src_name) else {
            state.record_error(ERR_NAME, format!("{}: unknown source", cc));
            return vec![er(ERR_NAME, cc)];
        };
        self.take(
            dest as u16,
            src as u16,
            levels.levels().map(u16::from),
            state,
            echo,
            peer,
            cc,
        )
    }

    fn take(
        &self,
        dest: u16,
        src: u16,
        levels: impl Iterator<Item = u16>,
        state: &mut ConnState,
        echo: bool,
        peer: PeerId,
        cc: &str,
    ) -> Vec<Frame> {
        let changes: Vec<RouteChange> = levels
            .map(|level| RouteChange { level, dest, src })
            .collect();
        if changes.is_empty() {
            state.record_error(ERR_SYNTAX, format!("{}: empty level set", cc));
            return vec![er(ERR_SYNTAX, cc)];
        }
        let outcome = self.matrix.set_routes(&changes, peer);
        if !outcome.any_accepted() {
            state.record_error(ERR_RANGE, format!("{}: index out of range", cc));
            return vec![er(ERR_RANGE, cc)];
        }
        if echo {
            vec![er(ERR_OK, cc)]
        } else {
            vec![]
        }
    }

    fn background(&self, params: &[String], state: &mut ConnState) -> Vec<Frame> {
        let config = self.matrix.config();
        let Some(sub) = params.first() else {
            state.record_error(ERR_SYNTAX, "BK: missing sub-code");
            return vec![er(ERR_SYNTAX, "BK")];
        };
        match sub.as_str() {
            "N" => vec![Frame::new("BK", vec!["N".into(), config.friendly_name])],
            "I" => vec![Frame::new("BK", vec!["I".into(), config.model_name])],
            "d" => vec![Frame::new(
                "BK",
                vec![
                    "d".into(),
                    hex4(config.outputs),
                    hex4(config.inputs),
                    hex4(config.levels),
                ],
            )],
            "T" => {
                state.echo = true;
                vec![er(ERR_OK, "BK")]
            }
            "t" => {
                state.echo = false;
                vec![]
            }
            "E" => {
                let on = if state.echo { "T" } else { "F" };
                vec![Frame::new("BK", vec!["E".into(), on.into()])]
            }
            "F" => vec![Frame::new(
                "BK",
                vec!["F".into(), format!("{:02X}", state.flags)],
            )],
            "f" => {
                state.flags = 0;
                if state.echo {
                    vec![er(ERR_OK, "BK")]
                } else {
                    vec![]
                }
            }
            "R" => {
                state.errors.clear();
                if state.echo {
                    vec![er(ERR_OK, "BK")]
                } else {
                    vec![]
                }
            }
            "A" => {
                state.async_takes = params.get(1).map(String::as_str) != Some("F");
                let on = if state.async_takes { "T" } else { "F" };
                vec![Frame::new("BK", vec!["A".into(), on.into()])]
            }
            "D" => {
                let today = Local::now().format("%Y-%m-%d").to_string();
                vec![Frame::new("BK", vec!["D".into(), today])]
            }
            "P" => vec![er(ERR_OK, "BK")],
            other => {
                state.record_error(ERR_SYNTAX, format!("BK: unknown sub-code {}", other));
                vec![er(ERR_SYNTAX, "BK")]
            }
        }
    }
}

/// Fold a matrix event into the connection's change flags and produce any
/// asynchronous notifications it warrants.
fn apply_event(state: &mut ConnState, event: MatrixEvent) -> Vec<Frame> {
    match event {
        MatrixEvent::Routed(changes) => {
            state.flags |= FLAG_ROUTING;
            if state.async_takes {
                changes
                    .iter()
                    .map(|c| Frame::new("AT", vec![status_param(c)]))
                    .collect()
            } else {
                vec![]
            }
        }
        MatrixEvent::InputLabelsChanged(_) => {
            state.flags |= FLAG_SRC_NAMES;
            vec![]
        }
        MatrixEvent::OutputLabelsChanged(_) => {
            state.flags |= FLAG_DEST_NAMES;
            vec![]
        }
        MatrixEvent::LevelNamesChanged(_) => {
            state.flags |= FLAG_LEVEL_NAMES;
            vec![]
        }
        MatrixEvent::LocksChanged(_) => vec![],
    }
}

fn find_by_name(labels: &[String], wanted: &str) -> Option<usize> {
    let wanted = wanted.trim();
    labels.iter().position(|l| l.trim() == wanted)
}
