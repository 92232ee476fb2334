// Native protocol message model.
//
// Wire shape: SOH 'N' '0' CC [HT param]* CKS-hi CKS-lo EOT, where CC is a
// two-character command code, params are HT-separated ASCII (commas split
// sub-fields inside one param), and the checksum is (256 - Σ body) mod 256
// over every body byte between SOH and the checksum digits, rendered as
// two upper-case hex digits.

use std::fmt;
use thiserror::Error;

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const HT: u8 = 0x09;

/// Fixed label width on the wire.
pub const NAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GvError {
    #[error("frame shorter than header and checksum")]
    Truncated,
    #[error("body does not start with protocol header N0")]
    BadHeader,
    #[error("checksum characters are not hex digits")]
    BadChecksumChars,
    #[error("frame exceeds maximum length")]
    TooLong,
}

pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Render an index as four upper-case hex digits.
pub fn hex4(v: u16) -> String {
    format!("{:04X}", v)
}

pub fn parse_hex4(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 4 {
        return None;
    }
    u16::from_str_radix(s, 16).ok()
}

/// Truncate / space-pad a label to the wire width.
pub fn fit_name(name: &str) -> String {
    let mut fitted: String = name.chars().take(NAME_LEN).collect();
    while fitted.chars().count() < NAME_LEN {
        fitted.push(' ');
    }
    fitted
}

/// 32-bit level set: bit *i* set means level *i* is included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelBitmap(pub u32);

impl LevelBitmap {
    pub fn single(level: u8) -> Self {
        Self(1 << level)
    }

    pub fn all(levels: u16) -> Self {
        if levels >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << levels) - 1)
        }
    }

    pub fn contains(self, level: u8) -> bool {
        level < 32 && self.0 & (1 << level) != 0
    }

    pub fn levels(self) -> impl Iterator<Item = u8> {
        (0u8..32).filter(move |l| self.contains(*l))
    }

    pub fn to_hex(self) -> String {
        format!("{:08X}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > 8 {
            return None;
        }
        u32::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for LevelBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One decoded protocol message.
///
/// `checksum_ok` is set by the decoder; a mismatch is logged by the engine
/// but the frame is dispatched anyway, matching the tolerant behavior of
/// the real control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub params: Vec<String>,
    pub checksum_ok: bool,
}

impl Frame {
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            command: command.into(),
            params,
            checksum_ok: true,
        }
    }

    /// Body bytes between SOH and the checksum digits.
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.params.iter().map(|p| p.len() + 1).sum::<usize>());
        body.extend_from_slice(b"N0");
        body.extend_from_slice(self.command.as_bytes());
        for p in &self.params {
            body.push(HT);
            body.extend_from_slice(p.as_bytes());
        }
        body
    }

    /// Full wire encoding: SOH body checksum EOT.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let cks = checksum(&body);
        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(SOH);
        out.extend_from_slice(&body);
        out.extend_from_slice(format!("{:02X}", cks).as_bytes());
        out.push(EOT);
        out
    }

    /// Parse the bytes strictly between SOH and EOT.
    pub fn parse(raw: &[u8]) -> Result<Frame, GvError> {
        if raw.len() < 6 {
            return Err(GvError::Truncated);
        }
        let (body, cks_chars) = raw.split_at(raw.len() - 2);
        let cks_str = std::str::from_utf8(cks_chars)
            .ok()
            .filter(|s| s.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or(GvError::BadChecksumChars)?;
        let sent = u8::from_str_radix(cks_str, 16).map_err(|_| GvError::BadChecksumChars)?;
        let checksum_ok = sent == checksum(body);

        if &body[..2] != b"N0" {
            return Err(GvError::BadHeader);
        }
        let mut fields = body[2..].split(|b| *b == HT);
        let command = fields
            .next()
            .filter(|c| c.len() == 2)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .ok_or(GvError::Truncated)?;
        let params = fields
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        Ok(Frame {
            command,
            params,
            checksum_ok,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_definition() {
        // Σ body = 0 -> checksum 0; otherwise 256 - (Σ mod 256)
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01]), 0xFF);
        assert_eq!(checksum(&[0x80, 0x80]), 0);
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(
            "TI",
            vec!["0003".into(), "0007".into(), "0000".into()],
        );
        let wire = frame.encode();
        assert_eq!(wire[0], SOH);
        assert_eq!(*wire.last().unwrap(), EOT);

        let parsed = Frame::parse(&wire[1..wire.len() - 1]).unwrap();
        assert!(parsed.checksum_ok);
        assert_eq!(parsed.command, "TI");
        assert_eq!(parsed.params, frame.params);

        // recomputing the checksum over the decoded body matches the wire
        let body = parsed.body();
        let sent = std::str::from_utf8(&wire[wire.len() - 3..wire.len() - 1]).unwrap();
        assert_eq!(u8::from_str_radix(sent, 16).unwrap(), checksum(&body));
    }

    #[test]
    fn checksum_mismatch_still_parses() {
        let mut wire = Frame::new("BK", vec!["F".into()]).encode();
        let len = wire.len();
        wire[len - 2] = b'0';
        wire[len - 3] = b'0';
        let parsed = Frame::parse(&wire[1..len - 1]).unwrap();
        assert!(!parsed.checksum_ok);
        assert_eq!(parsed.command, "BK");
    }

    #[test]
    fn casing_is_preserved() {
        let wire = Frame::new("Qd", vec!["OUT 1".into()]).encode();
        let parsed = Frame::parse(&wire[1..wire.len() - 1]).unwrap();
        assert_eq!(parsed.command, "Qd");
    }

    #[test]
    fn bitmap_rendering() {
        assert_eq!(LevelBitmap::single(0).to_hex(), "00000001");
        assert_eq!(LevelBitmap::all(3).to_hex(), "00000007");
        assert_eq!(LevelBitmap::from_hex("00000005").unwrap().levels().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(LevelBitmap::all(32).0, u32::MAX);
    }

    #[test]
    fn name_fitting() {
        assert_eq!(fit_name("Camera One Long"), "Camera O");
        assert_eq!(fit_name("VTR"), "VTR     ");
        assert_eq!(fit_name("").len(), NAME_LEN);
    }

    #[test]
    fn hex_params() {
        assert_eq!(hex4(3), "0003");
        assert_eq!(parse_hex4("0007"), Some(7));
        assert_eq!(parse_hex4("ffff"), Some(65535));
        assert_eq!(parse_hex4(""), None);
        assert_eq!(parse_hex4("12345"), None);
    }
}
