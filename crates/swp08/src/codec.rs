use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, FrameError, ACK, DLE, ETX, NAK, STX};
use crate::model::Message;

/// Sanity bound on one stuffed frame body; BTC caps real frames well
/// below this.
const MAX_FRAME_LEN: usize = 1024;

/// One received or transmitted wire item.
///
/// `Corrupt` only occurs on receive: the payload arrived between valid
/// markers but failed BTC, checksum, or length validation. The engine
/// answers it with `DLE NAK` and carries on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nak,
    Msg(Message),
    Corrupt(FrameError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A `tokio_util` codec for SW-P-08 framing.
#[derive(Debug, Clone, Default)]
pub struct Swp08Codec;

impl Decoder for Swp08Codec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // resynchronize on the next DLE
            let Some(start) = src.iter().position(|b| *b == DLE) else {
                src.clear();
                return Ok(None);
            };
            if start > 0 {
                src.advance(start);
            }
            if src.len() < 2 {
                return Ok(None);
            }
            match src[1] {
                ACK => {
                    src.advance(2);
                    return Ok(Some(Frame::Ack));
                }
                NAK => {
                    src.advance(2);
                    return Ok(Some(Frame::Nak));
                }
                STX => match scan_frame(&src[2..]) {
                    Scan::Complete { payload, consumed } => {
                        let item = frame::validate_payload(&payload)
                            .and_then(Message::decode_data)
                            .map_or_else(Frame::Corrupt, Frame::Msg);
                        src.advance(2 + consumed);
                        return Ok(Some(item));
                    }
                    Scan::Corrupt { consumed, error } => {
                        src.advance(2 + consumed);
                        return Ok(Some(Frame::Corrupt(error)));
                    }
                    Scan::Incomplete => {
                        if src.len() - 2 > MAX_FRAME_LEN {
                            let dropped = src.len();
                            src.advance(dropped);
                            return Ok(Some(Frame::Corrupt(FrameError::TooLong)));
                        }
                        return Ok(None);
                    }
                },
                _ => {
                    // stray DLE outside any frame
                    src.advance(1);
                }
            }
        }
    }
}

enum Scan {
    Complete { payload: Vec<u8>, consumed: usize },
    Corrupt { consumed: usize, error: FrameError },
    Incomplete,
}

/// Unstuff bytes after DLE STX until the closing DLE ETX.
fn scan_frame(body: &[u8]) -> Scan {
    let mut payload = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b != DLE {
            payload.push(b);
            i += 1;
            continue;
        }
        let Some(&next) = body.get(i + 1) else {
            return Scan::Incomplete;
        };
        match next {
            DLE => {
                payload.push(DLE);
                i += 2;
            }
            ETX => {
                return Scan::Complete {
                    payload,
                    consumed: i + 2,
                };
            }
            other => {
                // leave the DLE in the buffer: it may open the next frame
                return Scan::Corrupt {
                    consumed: i,
                    error: FrameError::UnexpectedDle(other),
                };
            }
        }
    }
    Scan::Incomplete
}

impl Encoder<Frame> for Swp08Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Ack => dst.extend_from_slice(&[DLE, ACK]),
            Frame::Nak => dst.extend_from_slice(&[DLE, NAK]),
            Frame::Msg(msg) => {
                let data = msg.encode_data()?;
                dst.extend_from_slice(&frame::encode_frame(&data));
            }
            Frame::Corrupt(_) => return Err(FrameError::NotEncodable.into()),
        }
        Ok(())
    }
}
