use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::HubMessage;

/// Upper bound on one block's wire size. A peer that streams more than
/// this without a terminating empty line gets its connection closed.
pub const MAX_BLOCK_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("block exceeds {MAX_BLOCK_LEN} bytes without terminator")]
    BlockTooLarge,
    #[error("malformed block framing")]
    Malformed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A `tokio_util` codec for Videohub protocol blocks.
#[derive(Debug, Clone, Default)]
pub struct HubCodec;

impl Decoder for HubCodec {
    type Item = HubMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let input = &src[..];
        match HubMessage::parse_block(input) {
            Ok((remaining, msg)) => {
                let consumed = input.len() - remaining.len();
                src.advance(consumed);
                Ok(Some(msg))
            }
            Err(nom::Err::Incomplete(_)) => {
                if src.len() > MAX_BLOCK_LEN {
                    Err(CodecError::BlockTooLarge)
                } else {
                    Ok(None)
                }
            }
            Err(_) => Err(CodecError::Malformed),
        }
    }
}

impl Encoder<HubMessage> for HubCodec {
    type Error = CodecError;

    fn encode(&mut self, item: HubMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_serialized(dst.writer())?;
        Ok(())
    }
}
