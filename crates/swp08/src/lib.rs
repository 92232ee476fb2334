#[cfg(feature = "codec")]
mod codec;
mod frame;
mod model;

#[cfg(feature = "codec")]
pub use codec::{CodecError, Frame, Swp08Codec};
pub use frame::{FrameError, ACK, DLE, ETX, NAK, STX};
pub use model::*;
