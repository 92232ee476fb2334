use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::model::{Frame, GvError, EOT, SOH};

/// Sanity bound on one frame between SOH and EOT.
const MAX_FRAME_LEN: usize = 4096;

/// One received item: a parsed frame (possibly with a failed checksum,
/// see [`Frame::checksum_ok`]) or a structurally unusable one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GvItem {
    Frame(Frame),
    Corrupt(GvError),
}

/// A `tokio_util` codec for Native protocol framing.
#[derive(Debug, Clone, Default)]
pub struct GvCodec;

impl Decoder for GvCodec {
    type Item = GvItem;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // resynchronize on SOH, dropping anything before it
        let Some(start) = src.iter().position(|b| *b == SOH) else {
            src.clear();
            return Ok(None);
        };
        if start > 0 {
            src.advance(start);
        }
        let Some(end) = src.iter().position(|b| *b == EOT) else {
            if src.len() > MAX_FRAME_LEN {
                let dropped = src.len();
                src.advance(dropped);
                return Ok(Some(GvItem::Corrupt(GvError::TooLong)));
            }
            return Ok(None);
        };

        let item = match Frame::parse(&src[1..end]) {
            Ok(frame) => GvItem::Frame(frame),
            Err(e) => GvItem::Corrupt(e),
        };
        src.advance(end + 1);
        Ok(Some(item))
    }
}

impl Encoder<Frame> for GvCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}
