#[cfg(feature = "codec")]
mod codec;
mod model;

#[cfg(feature = "codec")]
pub use codec::{GvCodec, GvItem};
pub use model::*;
