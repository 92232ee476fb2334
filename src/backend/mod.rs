//! Controller engines: the client side of each protocol.
//!
//! Every controller keeps a local [`Mirror`] of the remote router,
//! applies writes optimistically with a pending record per target, rolls
//! back on a negative reply, and reconnects with exponential backoff
//! until told to disconnect.

mod gvnative;
mod swp08;
mod videohub;

pub use gvnative::GvNativeController;
pub use swp08::Swp08Controller;
pub use videohub::VideohubController;

use crate::engine::{EngineEvent, Protocol};
use crate::matrix::{LabelChange, LockChange, LockOp, LockView, PeerId, RouteChange};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Connection parameters shared by the three controllers. Protocols that
/// cannot discover the matrix shape on the wire (SW-P-08) take it from
/// here.
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    pub levels: u16,
    pub inputs: u16,
    pub outputs: u16,
    /// `BK,F` change-flag poll cadence (GV Native only).
    pub poll_interval: Duration,
}

impl ControllerOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            auto_reconnect: true,
            levels: 1,
            inputs: 0,
            outputs: 0,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Pick a controller implementation by protocol name.
pub enum Controller {
    Videohub(VideohubController),
    Swp08(Swp08Controller),
    GvNative(GvNativeController),
}

impl Controller {
    pub fn new(protocol: Protocol, opts: ControllerOptions) -> Self {
        match protocol {
            Protocol::Videohub => Controller::Videohub(VideohubController::new(opts)),
            Protocol::Swp08 => Controller::Swp08(Swp08Controller::new(opts)),
            Protocol::GvNative => Controller::GvNative(GvNativeController::new(opts)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            Controller::Videohub(c) => c.connect().await,
            Controller::Swp08(c) => c.connect().await,
            Controller::GvNative(c) => c.connect().await,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            Controller::Videohub(c) => c.disconnect().await,
            Controller::Swp08(c) => c.disconnect().await,
            Controller::GvNative(c) => c.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Controller::Videohub(c) => c.is_connected(),
            Controller::Swp08(c) => c.is_connected(),
            Controller::GvNative(c) => c.is_connected(),
        }
    }

    pub fn set_route(&self, level: u16, dest: u16, src: u16) -> Result<()> {
        match self {
            Controller::Videohub(c) => c.set_route(level, dest, src),
            Controller::Swp08(c) => c.set_route(level, dest, src),
            Controller::GvNative(c) => c.set_route(level, dest, src),
        }
    }

    /// Destination locks only exist on the Videohub wire.
    pub fn set_lock(&self, dest: u16, op: LockOp) -> Result<()> {
        match self {
            Controller::Videohub(c) => c.set_lock(dest, op),
            _ => Err(anyhow!("this protocol has no destination locks")),
        }
    }

    /// Label writes are a Videohub capability; the other protocols only
    /// read name tables.
    pub fn set_input_label(&self, index: u16, text: &str) -> Result<()> {
        match self {
            Controller::Videohub(c) => c.set_input_label(index, text),
            _ => Err(anyhow!("this protocol cannot write labels")),
        }
    }

    pub fn set_output_label(&self, index: u16, text: &str) -> Result<()> {
        match self {
            Controller::Videohub(c) => c.set_output_label(index, text),
            _ => Err(anyhow!("this protocol cannot write labels")),
        }
    }

    pub fn state(&self) -> Mirror {
        match self {
            Controller::Videohub(c) => c.state(),
            Controller::Swp08(c) => c.state(),
            Controller::GvNative(c) => c.state(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        match self {
            Controller::Videohub(c) => c.subscribe(),
            Controller::Swp08(c) => c.subscribe(),
            Controller::GvNative(c) => c.subscribe(),
        }
    }
}

/// Last known remote state. Sparse: entries appear as the wire reports
/// them.
#[derive(Clone, Debug, Default)]
pub struct Mirror {
    pub inputs: Option<u16>,
    pub outputs: Option<u16>,
    pub levels: u16,
    pub model_name: Option<String>,
    pub friendly_name: Option<String>,
    pub input_labels: HashMap<u16, String>,
    pub output_labels: HashMap<u16, String>,
    pub level_names: HashMap<u16, String>,
    /// `(level, dest) -> src`
    pub routes: HashMap<(u16, u16), u16>,
    pub locks: HashMap<u16, LockView>,
}

impl Mirror {
    /// The connect() call resolves once this holds.
    pub fn has_initial_state(&self) -> bool {
        self.inputs.is_some() && self.outputs.is_some() && !self.routes.is_empty()
    }

    pub fn route(&self, level: u16, dest: u16) -> Option<u16> {
        self.routes.get(&(level, dest)).copied()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PendingKind {
    Route,
    Lock,
}

/// One optimistic write awaiting its authoritative echo.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Pending {
    Route {
        level: u16,
        dest: u16,
        old: Option<u16>,
        new: u16,
    },
    Lock {
        dest: u16,
        old: LockView,
        new: LockView,
    },
}

impl Pending {
    fn kind(&self) -> PendingKind {
        match self {
            Pending::Route { .. } => PendingKind::Route,
            Pending::Lock { .. } => PendingKind::Lock,
        }
    }
}

struct MirrorInner {
    mirror: Mirror,
    pending: Vec<Pending>,
}

/// State shared between a controller handle and its connection task.
pub(crate) struct ClientState {
    inner: Mutex<MirrorInner>,
    pub ui: broadcast::Sender<EngineEvent>,
    connected: watch::Sender<bool>,
}

impl ClientState {
    pub fn new(opts: &ControllerOptions) -> Self {
        let (ui, _) = broadcast::channel(256);
        let (connected, _) = watch::channel(false);
        let mirror = Mirror {
            levels: opts.levels.max(1),
            inputs: (opts.inputs > 0).then_some(opts.inputs),
            outputs: (opts.outputs > 0).then_some(opts.outputs),
            ..Mirror::default()
        };
        Self {
            inner: Mutex::new(MirrorInner {
                mirror,
                pending: Vec::new(),
            }),
            ui,
            connected,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.ui.send(event);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn snapshot(&self) -> Mirror {
        self.inner.lock().unwrap().mirror.clone()
    }

    pub fn has_initial_state(&self) -> bool {
        self.inner.lock().unwrap().mirror.has_initial_state()
    }

    pub fn set_counts(&self, inputs: u16, outputs: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.mirror.inputs = Some(inputs);
        inner.mirror.outputs = Some(outputs);
    }

    pub fn set_levels(&self, levels: u16) {
        self.inner.lock().unwrap().mirror.levels = levels.max(1);
    }

    pub fn set_identity(&self, model: Option<String>, friendly: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if model.is_some() {
            inner.mirror.model_name = model;
        }
        if friendly.is_some() {
            inner.mirror.friendly_name = friendly;
        }
    }

    /// An authoritative crosspoint report: clears any pending record on
    /// the same target and reconciles the mirror.
    pub fn authoritative_route(&self, level: u16, dest: u16, src: u16) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.retain(
                |p| !matches!(p, Pending::Route { level: l, dest: d, .. } if *l == level && *d == dest),
            );
            inner.mirror.routes.insert((level, dest), src) != Some(src)
        };
        if changed {
            self.emit(EngineEvent::RoutingChanged(vec![RouteChange {
                level,
                dest,
                src,
            }]));
        }
    }

    pub fn authoritative_lock(&self, dest: u16, view: LockView) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .pending
                .retain(|p| !matches!(p, Pending::Lock { dest: d, .. } if *d == dest));
            inner.mirror.locks.insert(dest, view) != Some(view)
        };
        if changed {
            self.emit(EngineEvent::LocksChanged(vec![lock_change(dest, view)]));
        }
    }

    /// Record an optimistic route write; at most one pending record per
    /// target.
    pub fn optimistic_route(&self, level: u16, dest: u16, src: u16) {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.mirror.routes.insert((level, dest), src);
        inner.pending.retain(
            |p| !matches!(p, Pending::Route { level: l, dest: d, .. } if *l == level && *d == dest),
        );
        inner.pending.push(Pending::Route {
            level,
            dest,
            old,
            new: src,
        });
        drop(inner);
        self.emit(EngineEvent::RoutingChanged(vec![RouteChange {
            level,
            dest,
            src,
        }]));
    }

    pub fn optimistic_lock(&self, dest: u16, view: LockView) {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.mirror.locks.insert(dest, view).unwrap_or_default();
        inner
            .pending
            .retain(|p| !matches!(p, Pending::Lock { dest: d, .. } if *d == dest));
        inner.pending.push(Pending::Lock {
            dest,
            old,
            new: view,
        });
        drop(inner);
        self.emit(EngineEvent::LocksChanged(vec![lock_change(dest, view)]));
    }

    /// A negative reply rolls back every pending record of that kind,
    /// restoring the last authoritative values.
    pub fn rollback(&self, kind: PendingKind) {
        let mut routes = Vec::new();
        let mut locks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let rolled: Vec<Pending> = {
                let (rolled, kept) = inner
                    .pending
                    .drain(..)
                    .partition(|p| p.kind() == kind);
                inner.pending = kept;
                rolled
            };
            for p in rolled {
                match p {
                    Pending::Route {
                        level, dest, old, ..
                    } => {
                        match old {
                            Some(src) => {
                                inner.mirror.routes.insert((level, dest), src);
                                routes.push(RouteChange { level, dest, src });
                            }
                            None => {
                                inner.mirror.routes.remove(&(level, dest));
                            }
                        };
                    }
                    Pending::Lock { dest, old, .. } => {
                        inner.mirror.locks.insert(dest, old);
                        locks.push(lock_change(dest, old));
                    }
                }
            }
        }
        if !routes.is_empty() {
            self.emit(EngineEvent::RoutingChanged(routes));
        }
        if !locks.is_empty() {
            self.emit(EngineEvent::LocksChanged(locks));
        }
    }

    /// Unconfirmed writes do not survive a reconnect.
    pub fn clear_pending(&self) {
        self.inner.lock().unwrap().pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn absorb_input_label(&self, index: u16, text: &str) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            inner.mirror.input_labels.insert(index, text.to_string())
                != Some(text.to_string())
        };
        if changed {
            self.emit(EngineEvent::InputLabelsChanged(vec![LabelChange {
                index,
                text: text.to_string(),
            }]));
        }
    }

    pub fn absorb_output_label(&self, index: u16, text: &str) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            inner.mirror.output_labels.insert(index, text.to_string())
                != Some(text.to_string())
        };
        if changed {
            self.emit(EngineEvent::OutputLabelsChanged(vec![LabelChange {
                index,
                text: text.to_string(),
            }]));
        }
    }

    pub fn absorb_level_name(&self, index: u16, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.mirror.level_names.insert(index, text.to_string());
    }
}

/// The lock-change payload a controller can honestly report: it knows
/// view, not ownership, so foreign owners are surfaced as a dummy peer.
fn lock_change(dest: u16, view: LockView) -> LockChange {
    let owner = match view {
        LockView::Owned => Some(PeerId::LOCAL),
        LockView::Locked => Some(PeerId(u64::MAX)),
        LockView::Unlocked => None,
    };
    LockChange { dest, owner }
}

/// Reconnect pacing: 1 s doubling to a 30 s ceiling.
pub(crate) struct Backoff {
    delay: Duration,
}

impl Backoff {
    const START: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            delay: Self::START,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::CAP);
        delay
    }
}

pub(crate) fn not_connected() -> anyhow::Error {
    anyhow!("not connected")
}
