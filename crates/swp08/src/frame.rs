// Transport framing: DLE STX payload DLE ETX, DLE doubled inside the
// payload, payload = data ‖ BTC ‖ CHK.
//
// BTC counts the data bytes plus the four framing bytes (this is what
// shipping control software puts on the wire: a five-byte crosspoint
// connect carries BTC 0x09). CHK is the two's complement of
// (Σ data + BTC) mod 256.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const DLE: u8 = 0x10;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Framing overhead counted into BTC: DLE STX … DLE ETX.
const BTC_OVERHEAD: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("byte count mismatch: field {field:#04x}, data length {actual}")]
    ByteCount { field: u8, actual: usize },
    #[error("checksum mismatch: got {got:#04x}, want {want:#04x}")]
    Checksum { got: u8, want: u8 },
    #[error("payload shorter than BTC and checksum")]
    Truncated,
    #[error("unexpected DLE {0:#04x} inside frame")]
    UnexpectedDle(u8),
    #[error("frame exceeds maximum length")]
    TooLong,
    #[error("message body truncated for opcode {0:#04x}")]
    BadLength(u8),
    #[error("address out of range for standard message")]
    AddressRange,
    #[error("received-only item cannot be encoded")]
    NotEncodable,
}

pub fn btc_for(data_len: usize) -> u8 {
    data_len as u8 + BTC_OVERHEAD
}

pub fn checksum(data: &[u8], btc: u8) -> u8 {
    let sum = data
        .iter()
        .fold(btc, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Wrap message data into a complete wire frame.
pub fn encode_frame(data: &[u8]) -> BytesMut {
    let btc = btc_for(data.len());
    let chk = checksum(data, btc);

    let mut out = BytesMut::with_capacity(data.len() + 8);
    out.put_u8(DLE);
    out.put_u8(STX);
    for b in data.iter().chain([&btc, &chk]) {
        out.put_u8(*b);
        if *b == DLE {
            out.put_u8(DLE);
        }
    }
    out.put_u8(DLE);
    out.put_u8(ETX);
    out
}

/// Check BTC and checksum of an unstuffed payload, returning the data.
pub fn validate_payload(payload: &[u8]) -> Result<&[u8], FrameError> {
    if payload.len() < 3 {
        return Err(FrameError::Truncated);
    }
    let (data, tail) = payload.split_at(payload.len() - 2);
    let (btc, chk) = (tail[0], tail[1]);
    if btc != btc_for(data.len()) {
        return Err(FrameError::ByteCount {
            field: btc,
            actual: data.len(),
        });
    }
    let want = checksum(data, btc);
    if chk != want {
        return Err(FrameError::Checksum { got: chk, want });
    }
    Ok(data)
}
