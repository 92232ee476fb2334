// Streaming block parser.
//
// Framing is parsed with nom streaming combinators so a partial block
// reports Incomplete; body lines are complete by then and are decoded
// line-by-line. A body line that fails to decode is counted as malformed
// rather than failing the block (the engine needs the count to pick ACK
// or NAK).

use crate::helpers::*;
use crate::model::*;
use nom::{character::streaming::multispace0, sequence::preceded, IResult};

fn parse_preamble(lines: &[&[u8]]) -> HubMessage {
    let version = lines
        .iter()
        .find_map(|l| split_kv(l))
        .filter(|(k, _)| k.eq_ignore_ascii_case(b"version"))
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default();
    HubMessage::ProtocolPreamble(Preamble { version })
}

fn parse_count(value: &[u8]) -> Option<u16> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn parse_device(lines: &[&[u8]]) -> HubMessage {
    let mut di = DeviceInfo::default();
    for line in lines {
        let Some((key, value)) = split_kv(line) else {
            continue;
        };
        let key = key.to_ascii_lowercase();
        let text = || String::from_utf8_lossy(value).into_owned();
        match key.as_slice() {
            b"device present" => di.present = Some(value == b"true"),
            b"model name" => di.model_name = Some(text()),
            b"friendly name" => di.friendly_name = Some(text()),
            b"unique id" => di.unique_id = Some(text()),
            b"video inputs" => di.video_inputs = parse_count(value),
            b"video outputs" => di.video_outputs = parse_count(value),
            _ => {}
        }
    }
    HubMessage::DeviceInfo(di)
}

fn parse_labels(lines: &[&[u8]]) -> Entries<Label> {
    let mut out = Entries::default();
    for line in lines {
        match split_index(line) {
            Some((index, rest)) => out.entries.push(Label {
                index,
                text: String::from_utf8_lossy(rest).into_owned(),
            }),
            None => out.malformed += 1,
        }
    }
    out
}

fn parse_routes(lines: &[&[u8]]) -> Entries<Route> {
    let mut out = Entries::default();
    for line in lines {
        let src = split_index(line).and_then(|(dest, rest)| {
            let src: u16 = std::str::from_utf8(rest.trim_ascii()).ok()?.parse().ok()?;
            Some(Route { dest, src })
        });
        match src {
            Some(route) => out.entries.push(route),
            None => out.malformed += 1,
        }
    }
    out
}

fn parse_locks(lines: &[&[u8]]) -> Entries<LockEntry> {
    let mut out = Entries::default();
    for line in lines {
        let entry = split_index(line).and_then(|(dest, rest)| {
            let state = match rest.trim_ascii() {
                b"O" | b"o" => LockState::Owned,
                b"L" | b"l" => LockState::Locked,
                b"U" | b"u" => LockState::Unlocked,
                b"F" | b"f" => LockState::ForceUnlock,
                _ => return None,
            };
            Some(LockEntry { dest, state })
        });
        match entry {
            Some(lock) => out.entries.push(lock),
            None => out.malformed += 1,
        }
    }
    out
}

fn parse_settings(lines: &[&[u8]]) -> Vec<Setting> {
    lines
        .iter()
        .filter_map(|l| split_kv(l))
        .map(|(k, v)| Setting {
            name: String::from_utf8_lossy(k).into_owned(),
            value: String::from_utf8_lossy(v).into_owned(),
        })
        .collect()
}

impl HubMessage {
    /// Parse one block including its terminating empty line.
    pub fn parse_block(i: &[u8]) -> IResult<&[u8], HubMessage> {
        let (i, header) = preceded(multispace0, line_text)(i)?;
        let (mut i, _) = line_break(i)?;

        let mut lines: Vec<&[u8]> = Vec::new();
        loop {
            match line_break(i) {
                // empty line terminates the block
                Ok((rest, _)) => {
                    i = rest;
                    break;
                }
                Err(nom::Err::Incomplete(n)) => return Err(nom::Err::Incomplete(n)),
                Err(_) => {}
            }
            let (rest, line) = line_text(i)?;
            let (rest, _) = line_break(rest)?;
            lines.push(line);
            i = rest;
        }

        Ok((i, Self::dispatch(header.trim_ascii(), &lines)))
    }

    fn dispatch(header: &[u8], lines: &[&[u8]]) -> HubMessage {
        match header.to_ascii_uppercase().as_slice() {
            b"PROTOCOL PREAMBLE:" => parse_preamble(lines),
            b"VIDEOHUB DEVICE:" => parse_device(lines),
            b"INPUT LABELS:" => HubMessage::InputLabels(parse_labels(lines)),
            b"OUTPUT LABELS:" => HubMessage::OutputLabels(parse_labels(lines)),
            b"VIDEO OUTPUT ROUTING:" => HubMessage::OutputRouting(parse_routes(lines)),
            b"VIDEO OUTPUT LOCKS:" => HubMessage::OutputLocks(parse_locks(lines)),
            b"CONFIGURATION:" => HubMessage::Configuration(parse_settings(lines)),
            b"PING:" => HubMessage::Ping,
            b"ACK" => HubMessage::Ack,
            b"NAK" => HubMessage::Nak,
            b"END PRELUDE:" => HubMessage::EndPrelude,
            upper => HubMessage::Unknown {
                header: String::from_utf8_lossy(upper).into_owned(),
                body: lines
                    .iter()
                    .map(|l| String::from_utf8_lossy(l).into_owned())
                    .collect(),
            },
        }
    }

    /// Parse an entire conversation of blocks.
    pub fn parse_all(input: &[u8]) -> IResult<&[u8], Vec<HubMessage>> {
        let mut i = input;
        let mut messages = Vec::new();
        loop {
            let (ni, message) = Self::parse_block(i)?;
            messages.push(message);
            if ni.is_empty() {
                return Ok((ni, messages));
            }
            i = ni;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_block() {
        let (rem, msg) = HubMessage::parse_block(b"PING:\n\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(msg, HubMessage::Ping);
    }

    #[test]
    fn preamble_any_line_ending() {
        for raw in [
            &b"PROTOCOL PREAMBLE:\nVersion: 2.7\n\n"[..],
            &b"PROTOCOL PREAMBLE:\r\nVersion: 2.7\r\n\r\n"[..],
            &b"PROTOCOL PREAMBLE:\rVersion: 2.7\r\rnext"[..],
        ] {
            let (_, msg) = HubMessage::parse_block(raw).unwrap();
            match msg {
                HubMessage::ProtocolPreamble(p) => assert_eq!(p.version, "2.7"),
                other => panic!("expected preamble, got {:?}", other),
            }
        }
    }

    #[test]
    fn device_block_case_insensitive() {
        let raw = b"videohub device:\n\
                    Device present: true\n\
                    Model name: Smart Videohub 12x12\n\
                    Video inputs: 12\n\
                    Video outputs: 12\n\n";
        let (rem, msg) = HubMessage::parse_block(raw).unwrap();
        assert!(rem.is_empty());
        match msg {
            HubMessage::DeviceInfo(d) => {
                assert_eq!(d.present, Some(true));
                assert_eq!(d.model_name.as_deref(), Some("Smart Videohub 12x12"));
                assert_eq!(d.video_inputs, Some(12));
                assert_eq!(d.video_outputs, Some(12));
            }
            other => panic!("expected device info, got {:?}", other),
        }
    }

    #[test]
    fn labels_keep_embedded_spaces() {
        let (_, msg) = HubMessage::parse_block(b"INPUT LABELS:\n0 Camera  Left\n1 \n\n").unwrap();
        match msg {
            HubMessage::InputLabels(ls) => {
                assert_eq!(ls.entries.len(), 2);
                assert_eq!(ls.entries[0].text, "Camera  Left");
                assert_eq!(ls.entries[1].text, "");
                assert_eq!(ls.malformed, 0);
            }
            other => panic!("expected input labels, got {:?}", other),
        }
    }

    #[test]
    fn routing_counts_malformed_lines() {
        let (_, msg) =
            HubMessage::parse_block(b"VIDEO OUTPUT ROUTING:\n3 7\nbogus\n4 nine\n\n").unwrap();
        match msg {
            HubMessage::OutputRouting(rs) => {
                assert_eq!(rs.entries, vec![Route { dest: 3, src: 7 }]);
                assert_eq!(rs.malformed, 2);
                assert!(!rs.is_query());
            }
            other => panic!("expected routing, got {:?}", other),
        }
    }

    #[test]
    fn lock_states() {
        let (_, msg) =
            HubMessage::parse_block(b"VIDEO OUTPUT LOCKS:\n0 O\n1 l\n2 U\n3 F\n\n").unwrap();
        match msg {
            HubMessage::OutputLocks(ls) => {
                let states: Vec<_> = ls.entries.iter().map(|e| e.state).collect();
                assert_eq!(
                    states,
                    vec![
                        LockState::Owned,
                        LockState::Locked,
                        LockState::Unlocked,
                        LockState::ForceUnlock
                    ]
                );
            }
            other => panic!("expected locks, got {:?}", other),
        }
    }

    #[test]
    fn partial_input_is_incomplete() {
        assert!(HubMessage::parse_block(b"VIDEO OUT")
            .unwrap_err()
            .is_incomplete());
        assert!(HubMessage::parse_block(b"VIDEO OUTPUT ROUTING:\n3 7\n")
            .unwrap_err()
            .is_incomplete());
        // trailing CR may be half of a CRLF
        assert!(HubMessage::parse_block(b"PING:\r\n\r")
            .unwrap_err()
            .is_incomplete());
    }

    #[test]
    fn unknown_header_preserved() {
        let (_, msg) = HubMessage::parse_block(b"FROBNICATE:\n1 2\n\n").unwrap();
        match msg {
            HubMessage::Unknown { header, body } => {
                assert_eq!(header, "FROBNICATE:");
                assert_eq!(body, vec!["1 2".to_string()]);
            }
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn conversation() {
        let raw = b"PROTOCOL PREAMBLE:\nVersion: 2.7\n\nINPUT LABELS:\n0 A\n\nACK\n\n";
        let (rem, msgs) = HubMessage::parse_all(raw).unwrap();
        assert!(rem.is_empty());
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], HubMessage::ProtocolPreamble(_)));
        assert!(matches!(msgs[1], HubMessage::InputLabels(_)));
        assert_eq!(msgs[2], HubMessage::Ack);
    }
}
