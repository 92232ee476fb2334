// Message model.
//
// Standard messages carry 10-bit addresses: a multiplier byte with the
// destination high bits in bits 4-6 and the source high bits in bits 0-2
// (vendor-manual layout), plus 7-bit low bytes. Extended messages carry
// plain big-endian 16-bit addresses.

use crate::frame::FrameError;

/// Label width selector used by the name messages: index 0/1/2 on the
/// wire, 4/8/12 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CharLen {
    Four,
    #[default]
    Eight,
    Twelve,
}

impl CharLen {
    pub fn chars(self) -> usize {
        match self {
            CharLen::Four => 4,
            CharLen::Eight => 8,
            CharLen::Twelve => 12,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            CharLen::Four => 0,
            CharLen::Eight => 1,
            CharLen::Twelve => 2,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(CharLen::Four),
            1 => Some(CharLen::Eight),
            2 => Some(CharLen::Twelve),
            _ => None,
        }
    }

    /// Truncate / space-pad a label to exactly this width.
    pub fn fit(self, name: &str) -> String {
        let width = self.chars();
        let mut fitted: String = name.chars().take(width).collect();
        while fitted.chars().count() < width {
            fitted.push(' ');
        }
        fitted
    }
}

/// Matrix in the high nibble, level in the low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatrixLevel {
    pub matrix: u8,
    pub level: u8,
}

impl MatrixLevel {
    pub fn level(level: u8) -> Self {
        Self { matrix: 0, level }
    }

    pub fn to_byte(self) -> u8 {
        (self.matrix << 4) | (self.level & 0x0F)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            matrix: b >> 4,
            level: b & 0x0F,
        }
    }
}

/// Largest address expressible in a standard (7+3 bit) message.
pub const MAX_STANDARD_ADDRESS: u16 = 0x3FF;

pub fn pack_multiplier(dest: u16, src: u16) -> u8 {
    let dest_high = ((dest >> 7) & 0x07) as u8;
    let src_high = ((src >> 7) & 0x07) as u8;
    (dest_high << 4) | src_high
}

pub fn unpack_dest(mult: u8, low: u8) -> u16 {
    ((((mult >> 4) & 0x07) as u16) << 7) | (low & 0x7F) as u16
}

pub fn unpack_src(mult: u8, low: u8) -> u16 {
    (((mult & 0x07) as u16) << 7) | (low & 0x7F) as u16
}

fn check_standard(addr: u16) -> Result<u16, FrameError> {
    if addr > MAX_STANDARD_ADDRESS {
        Err(FrameError::AddressRange)
    } else {
        Ok(addr)
    }
}

/// A batch of fixed-width names starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamesBatch {
    pub matrix: u8,
    pub len: CharLen,
    pub start: u16,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// 0x01: ask for the source routed to one destination.
    Interrogate { ml: MatrixLevel, dest: u16 },
    /// 0x02: route `src` to `dest`.
    Connect { ml: MatrixLevel, dest: u16, src: u16 },
    /// 0x03: crosspoint tally (reply to interrogate / dump).
    Tally { ml: MatrixLevel, dest: u16, src: u16 },
    /// 0x04: crosspoint changed notification.
    Connected { ml: MatrixLevel, dest: u16, src: u16 },
    /// 0x15: request one tally per destination of a level.
    TallyDumpRequest { ml: MatrixLevel },
    /// 0x64 / 0x66
    SrcNamesRequest { matrix: u8, len: CharLen },
    DestNamesRequest { matrix: u8, len: CharLen },
    /// 0x6A / 0x6B
    SrcNamesResponse(NamesBatch),
    DestNamesResponse(NamesBatch),
    /// 0x81 / 0x82 / 0x83 / 0x84: 16-bit address space.
    InterrogateExt { matrix: u8, level: u8, dest: u16 },
    ConnectExt { matrix: u8, level: u8, dest: u16, src: u16 },
    TallyExt { matrix: u8, level: u8, dest: u16, src: u16 },
    ConnectedExt { matrix: u8, level: u8, dest: u16, src: u16 },
    /// 0x95
    TallyDumpRequestExt { matrix: u8, level: u8 },
    /// 0xE4 / 0xE6
    SrcNamesRequestExt { matrix: u8, len: CharLen },
    DestNamesRequestExt { matrix: u8, len: CharLen },
    /// 0xEA / 0xEB
    SrcNamesResponseExt(NamesBatch),
    DestNamesResponseExt(NamesBatch),
    /// Valid frame, opcode we do not speak. ACKed and ignored.
    Unknown(Vec<u8>),
}

fn names_data(op: u8, batch: &NamesBatch) -> Vec<u8> {
    let mut data = vec![
        op,
        batch.matrix,
        batch.len.index(),
        (batch.start >> 8) as u8,
        (batch.start & 0xFF) as u8,
        batch.names.len() as u8,
    ];
    for name in &batch.names {
        data.extend_from_slice(batch.len.fit(name).as_bytes());
    }
    data
}

fn parse_names(op: u8, data: &[u8]) -> Result<NamesBatch, FrameError> {
    if data.len() < 6 {
        return Err(FrameError::BadLength(op));
    }
    let len = CharLen::from_index(data[2]).ok_or(FrameError::BadLength(op))?;
    let count = data[5] as usize;
    let body = &data[6..];
    if body.len() != count * len.chars() {
        return Err(FrameError::BadLength(op));
    }
    let names = body
        .chunks(len.chars())
        .map(|c| String::from_utf8_lossy(c).trim_end().to_string())
        .collect();
    Ok(NamesBatch {
        matrix: data[1],
        len,
        start: ((data[3] as u16) << 8) | data[4] as u16,
        names,
    })
}

impl Message {
    pub fn opcode(&self) -> u8 {
        match self {
            Message::Interrogate { .. } => 0x01,
            Message::Connect { .. } => 0x02,
            Message::Tally { .. } => 0x03,
            Message::Connected { .. } => 0x04,
            Message::TallyDumpRequest { .. } => 0x15,
            Message::SrcNamesRequest { .. } => 0x64,
            Message::DestNamesRequest { .. } => 0x66,
            Message::SrcNamesResponse(_) => 0x6A,
            Message::DestNamesResponse(_) => 0x6B,
            Message::InterrogateExt { .. } => 0x81,
            Message::ConnectExt { .. } => 0x82,
            Message::TallyExt { .. } => 0x83,
            Message::ConnectedExt { .. } => 0x84,
            Message::TallyDumpRequestExt { .. } => 0x95,
            Message::SrcNamesRequestExt { .. } => 0xE4,
            Message::DestNamesRequestExt { .. } => 0xE6,
            Message::SrcNamesResponseExt(_) => 0xEA,
            Message::DestNamesResponseExt(_) => 0xEB,
            Message::Unknown(data) => data.first().copied().unwrap_or(0),
        }
    }

    /// Serialize to message data (opcode included, no framing).
    pub fn encode_data(&self) -> Result<Vec<u8>, FrameError> {
        Ok(match *self {
            Message::Interrogate { ml, dest } => {
                check_standard(dest)?;
                vec![
                    0x01,
                    ml.to_byte(),
                    pack_multiplier(dest, 0),
                    (dest & 0x7F) as u8,
                ]
            }
            Message::Connect { ml, dest, src }
            | Message::Tally { ml, dest, src }
            | Message::Connected { ml, dest, src } => {
                check_standard(dest)?;
                check_standard(src)?;
                vec![
                    self.opcode(),
                    ml.to_byte(),
                    pack_multiplier(dest, src),
                    (dest & 0x7F) as u8,
                    (src & 0x7F) as u8,
                ]
            }
            Message::TallyDumpRequest { ml } => vec![0x15, ml.to_byte()],
            Message::SrcNamesRequest { matrix, len } => vec![0x64, matrix, len.index()],
            Message::DestNamesRequest { matrix, len } => vec![0x66, matrix, len.index()],
            Message::SrcNamesResponse(ref batch) => names_data(0x6A, batch),
            Message::DestNamesResponse(ref batch) => names_data(0x6B, batch),
            Message::InterrogateExt {
                matrix,
                level,
                dest,
            } => {
                vec![0x81, matrix, level, (dest >> 8) as u8, (dest & 0xFF) as u8]
            }
            Message::ConnectExt {
                matrix,
                level,
                dest,
                src,
            }
            | Message::TallyExt {
                matrix,
                level,
                dest,
                src,
            }
            | Message::ConnectedExt {
                matrix,
                level,
                dest,
                src,
            } => vec![
                self.opcode(),
                matrix,
                level,
                (dest >> 8) as u8,
                (dest & 0xFF) as u8,
                (src >> 8) as u8,
                (src & 0xFF) as u8,
            ],
            Message::TallyDumpRequestExt { matrix, level } => vec![0x95, matrix, level],
            Message::SrcNamesRequestExt { matrix, len } => vec![0xE4, matrix, len.index()],
            Message::DestNamesRequestExt { matrix, len } => vec![0xE6, matrix, len.index()],
            Message::SrcNamesResponseExt(ref batch) => names_data(0xEA, batch),
            Message::DestNamesResponseExt(ref batch) => names_data(0xEB, batch),
            Message::Unknown(ref data) => data.clone(),
        })
    }

    /// Parse validated message data (opcode first, framing already removed).
    pub fn decode_data(data: &[u8]) -> Result<Message, FrameError> {
        let op = *data.first().ok_or(FrameError::Truncated)?;
        let need = |len: usize| {
            if data.len() == len {
                Ok(())
            } else {
                Err(FrameError::BadLength(op))
            }
        };
        Ok(match op {
            0x01 => {
                need(4)?;
                Message::Interrogate {
                    ml: MatrixLevel::from_byte(data[1]),
                    dest: unpack_dest(data[2], data[3]),
                }
            }
            0x02 | 0x03 | 0x04 => {
                need(5)?;
                let ml = MatrixLevel::from_byte(data[1]);
                let dest = unpack_dest(data[2], data[3]);
                let src = unpack_src(data[2], data[4]);
                match op {
                    0x02 => Message::Connect { ml, dest, src },
                    0x03 => Message::Tally { ml, dest, src },
                    _ => Message::Connected { ml, dest, src },
                }
            }
            0x15 => {
                need(2)?;
                Message::TallyDumpRequest {
                    ml: MatrixLevel::from_byte(data[1]),
                }
            }
            0x64 | 0x66 => {
                need(3)?;
                let len = CharLen::from_index(data[2]).ok_or(FrameError::BadLength(op))?;
                let matrix = data[1];
                if op == 0x64 {
                    Message::SrcNamesRequest { matrix, len }
                } else {
                    Message::DestNamesRequest { matrix, len }
                }
            }
            0x6A => Message::SrcNamesResponse(parse_names(op, data)?),
            0x6B => Message::DestNamesResponse(parse_names(op, data)?),
            0x81 => {
                need(5)?;
                Message::InterrogateExt {
                    matrix: data[1],
                    level: data[2],
                    dest: ((data[3] as u16) << 8) | data[4] as u16,
                }
            }
            0x82 | 0x83 | 0x84 => {
                need(7)?;
                let matrix = data[1];
                let level = data[2];
                let dest = ((data[3] as u16) << 8) | data[4] as u16;
                let src = ((data[5] as u16) << 8) | data[6] as u16;
                match op {
                    0x82 => Message::ConnectExt {
                        matrix,
                        level,
                        dest,
                        src,
                    },
                    0x83 => Message::TallyExt {
                        matrix,
                        level,
                        dest,
                        src,
                    },
                    _ => Message::ConnectedExt {
                        matrix,
                        level,
                        dest,
                        src,
                    },
                }
            }
            0x95 => {
                need(3)?;
                Message::TallyDumpRequestExt {
                    matrix: data[1],
                    level: data[2],
                }
            }
            0xE4 | 0xE6 => {
                need(3)?;
                let len = CharLen::from_index(data[2]).ok_or(FrameError::BadLength(op))?;
                let matrix = data[1];
                if op == 0xE4 {
                    Message::SrcNamesRequestExt { matrix, len }
                } else {
                    Message::DestNamesRequestExt { matrix, len }
                }
            }
            0xEA => Message::SrcNamesResponseExt(parse_names(op, data)?),
            0xEB => Message::DestNamesResponseExt(parse_names(op, data)?),
            _ => Message::Unknown(data.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_address_roundtrip() {
        for addr in 0..=MAX_STANDARD_ADDRESS {
            let mult = pack_multiplier(addr, addr);
            assert_eq!(unpack_dest(mult, (addr & 0x7F) as u8), addr);
            assert_eq!(unpack_src(mult, (addr & 0x7F) as u8), addr);
        }
    }

    #[test]
    fn multiplier_bit_layout() {
        // dest-high goes in bits 4-6, src-high in bits 0-2
        assert_eq!(pack_multiplier(0x3FF, 0), 0x70);
        assert_eq!(pack_multiplier(0, 0x3FF), 0x07);
        assert_eq!(pack_multiplier(128, 256), 0x12);
    }

    #[test]
    fn message_roundtrip() {
        let messages = [
            Message::Interrogate {
                ml: MatrixLevel::level(1),
                dest: 900,
            },
            Message::Connect {
                ml: MatrixLevel::level(0),
                dest: 3,
                src: 7,
            },
            Message::Tally {
                ml: MatrixLevel::level(2),
                dest: 1023,
                src: 511,
            },
            Message::Connected {
                ml: MatrixLevel::level(0),
                dest: 130,
                src: 258,
            },
            Message::TallyDumpRequest {
                ml: MatrixLevel::level(3),
            },
            Message::SrcNamesRequest {
                matrix: 0,
                len: CharLen::Twelve,
            },
            Message::DestNamesRequest {
                matrix: 1,
                len: CharLen::Four,
            },
            Message::SrcNamesResponse(NamesBatch {
                matrix: 0,
                len: CharLen::Eight,
                start: 4,
                names: vec!["Cam 1".into(), "VTR".into()],
            }),
            Message::InterrogateExt {
                matrix: 0,
                level: 1,
                dest: 40000,
            },
            Message::ConnectExt {
                matrix: 0,
                level: 0,
                dest: 65535,
                src: 12345,
            },
            Message::TallyDumpRequestExt {
                matrix: 0,
                level: 7,
            },
            Message::DestNamesResponseExt(NamesBatch {
                matrix: 0,
                len: CharLen::Twelve,
                start: 0,
                names: vec!["Monitor Wall".into()],
            }),
        ];
        for msg in messages {
            let data = msg.encode_data().unwrap();
            assert_eq!(Message::decode_data(&data).unwrap(), msg, "{:?}", msg);
        }
    }

    #[test]
    fn extended_address_roundtrip_extremes() {
        for addr in [0u16, 1, 255, 256, 1023, 1024, 40000, 65535] {
            let msg = Message::ConnectExt {
                matrix: 0,
                level: 0,
                dest: addr,
                src: addr,
            };
            let data = msg.encode_data().unwrap();
            assert_eq!(Message::decode_data(&data).unwrap(), msg);
        }
    }

    #[test]
    fn standard_encode_rejects_wide_addresses() {
        let msg = Message::Connect {
            ml: MatrixLevel::level(0),
            dest: 1024,
            src: 0,
        };
        assert_eq!(msg.encode_data(), Err(FrameError::AddressRange));
    }

    #[test]
    fn names_are_fixed_width() {
        let batch = NamesBatch {
            matrix: 0,
            len: CharLen::Four,
            start: 0,
            names: vec!["Camera Long".into(), "A".into()],
        };
        let data = names_data(0x6A, &batch);
        assert_eq!(&data[6..10], b"Came");
        assert_eq!(&data[10..14], b"A   ");
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert_eq!(
            Message::decode_data(&[0x02, 0x00, 0x00]),
            Err(FrameError::BadLength(0x02))
        );
    }

    #[test]
    fn unknown_opcode_is_preserved() {
        let msg = Message::decode_data(&[0x42, 0x01, 0x02]).unwrap();
        assert_eq!(msg, Message::Unknown(vec![0x42, 0x01, 0x02]));
    }
}
