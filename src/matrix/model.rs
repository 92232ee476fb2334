use serde::{Deserialize, Serialize};

/// Opaque lock-owner handle assigned per connection. The model never
/// holds references into I/O objects; release on disconnect is driven by
/// an explicit hook from the connection task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Writes originating from the local UI rather than a connection.
    pub const LOCAL: PeerId = PeerId(0);
}

/// Static shape and identity of the simulated router.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub levels: u16,
    pub inputs: u16,
    pub outputs: u16,
    pub model_name: String,
    pub friendly_name: String,
    pub unique_id: String,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            levels: 1,
            inputs: 12,
            outputs: 12,
            model_name: "Smart Videohub 12x12".into(),
            friendly_name: "Polyroute".into(),
            unique_id: "A0B1C2D3".into(),
        }
    }
}

/// One crosspoint assignment.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RouteChange {
    pub level: u16,
    pub dest: u16,
    pub src: u16,
}

/// A lock transition; `owner` is the post-mutation owner.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LockChange {
    pub dest: u16,
    pub owner: Option<PeerId>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockOp {
    /// Take ownership; transfers even when held by another peer.
    Own,
    /// Release; only the owner may do this.
    Unlock,
    /// Release regardless of owner.
    Force,
}

/// Lock state as one peer sees it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LockView {
    Owned,
    Locked,
    #[default]
    Unlocked,
}

impl LockView {
    pub fn relative_to(owner: Option<PeerId>, viewer: PeerId) -> Self {
        match owner {
            Some(p) if p == viewer => LockView::Owned,
            Some(_) => LockView::Locked,
            None => LockView::Unlocked,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelChange {
    pub index: u16,
    pub text: String,
}

/// Broadcast on every committed mutation. Payloads carry the applied
/// subset only, enough to re-render without a read-back.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MatrixEvent {
    Routed(Vec<RouteChange>),
    LocksChanged(Vec<LockChange>),
    InputLabelsChanged(Vec<LabelChange>),
    OutputLabelsChanged(Vec<LabelChange>),
    LevelNamesChanged(Vec<LabelChange>),
}

/// Per-entry results of a batched mutation.
///
/// `accepted` counts entries that were in bounds and authorized, whether
/// or not they changed anything; `applied` holds the effective changes.
/// The wire engines answer ACK when `accepted > 0` and NAK otherwise.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Outcome<T> {
    pub applied: Vec<T>,
    pub accepted: usize,
    pub rejected: usize,
}

impl<T> Outcome<T> {
    pub fn any_accepted(&self) -> bool {
        self.accepted > 0
    }
}

/// Point-in-time copy of the whole model, lock view rendered for one
/// peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatrixSnapshot {
    pub config: MatrixConfig,
    pub input_labels: Vec<String>,
    pub output_labels: Vec<String>,
    pub level_names: Vec<String>,
    /// `routes[level][dest] = src`
    pub routes: Vec<Vec<u16>>,
    pub locks: Vec<LockView>,
}

impl MatrixSnapshot {
    pub fn route(&self, level: u16, dest: u16) -> Option<u16> {
        self.routes
            .get(level as usize)
            .and_then(|l| l.get(dest as usize))
            .copied()
    }
}

/// Default level naming: the video plane, then embedded audio planes.
pub fn default_level_name(level: u16) -> String {
    if level == 0 {
        "Video".into()
    } else {
        format!("Audio {}", level)
    }
}
