// Videohub Ethernet Protocol data model.
//
// A conversation is a sequence of blocks: a header line ending in `:`,
// zero or more body lines, then one empty line. `ACK` and `NAK` are
// headerless single-word blocks.

use std::fmt;
use version_compare::{compare_to, Cmp};

/// `PROTOCOL PREAMBLE:` block.
///
/// ```text
/// PROTOCOL PREAMBLE:↵
/// Version: 2.7↵
/// ↵
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Preamble {
    pub version: String,
}

impl Preamble {
    /// True if this peer speaks at least `minimum` (e.g. `"2.0"`).
    pub fn at_least(&self, minimum: &str) -> bool {
        compare_to(&self.version, minimum, Cmp::Ge).unwrap_or(false)
    }
}

/// `VIDEOHUB DEVICE:` block. Fields absent from the wire stay `None`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    pub present: Option<bool>,
    pub model_name: Option<String>,
    pub friendly_name: Option<String>,
    pub unique_id: Option<String>,
    pub video_inputs: Option<u16>,
    pub video_outputs: Option<u16>,
}

/// One `<index> <text>` line of a labels block. Text may be empty and may
/// contain embedded spaces; the first whitespace run after the index
/// delimits.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Label {
    pub index: u16,
    pub text: String,
}

/// One `<dest> <src>` line of `VIDEO OUTPUT ROUTING:`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Route {
    pub dest: u16,
    pub src: u16,
}

/// Lock state as seen by one peer. `F` only appears in requests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LockState {
    /// Owned by the receiving peer (`O`).
    Owned,
    /// Held by some other peer (`L`).
    Locked,
    /// Not held (`U`).
    #[default]
    Unlocked,
    /// Force-unlock request (`F`).
    ForceUnlock,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            LockState::Owned => "O",
            LockState::Locked => "L",
            LockState::Unlocked => "U",
            LockState::ForceUnlock => "F",
        })
    }
}

/// One `<dest> <state>` line of `VIDEO OUTPUT LOCKS:`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LockEntry {
    pub dest: u16,
    pub state: LockState,
}

/// One `<setting>: <value>` line of `CONFIGURATION:`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

/// Body of a writable section.
///
/// An empty body is a query; body lines that fail to parse are counted so
/// the receiver can tell "query" from "update in which every entry was
/// garbage" (the latter must be answered with `NAK`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Entries<T> {
    pub entries: Vec<T>,
    pub malformed: usize,
}

impl<T> Entries<T> {
    pub fn is_query(&self) -> bool {
        self.entries.is_empty() && self.malformed == 0
    }
}

impl<T> From<Vec<T>> for Entries<T> {
    fn from(entries: Vec<T>) -> Self {
        Self {
            entries,
            malformed: 0,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HubMessage {
    /// `PROTOCOL PREAMBLE:`
    ProtocolPreamble(Preamble),
    /// `VIDEOHUB DEVICE:`
    DeviceInfo(DeviceInfo),
    /// `INPUT LABELS:`
    InputLabels(Entries<Label>),
    /// `OUTPUT LABELS:`
    OutputLabels(Entries<Label>),
    /// `VIDEO OUTPUT ROUTING:`
    OutputRouting(Entries<Route>),
    /// `VIDEO OUTPUT LOCKS:`
    OutputLocks(Entries<LockEntry>),
    /// `CONFIGURATION:`
    Configuration(Vec<Setting>),
    /// `PING:`
    Ping,
    /// `ACK`
    Ack,
    /// `NAK`
    Nak,
    /// `END PRELUDE:`
    EndPrelude,
    /// Anything else; receivers ignore these silently.
    Unknown { header: String, body: Vec<String> },
}
