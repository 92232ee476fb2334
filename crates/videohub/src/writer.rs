// Block writer. Emits LF endings; the parser eats its own output.

use super::model::*;
use bytes::{BufMut, BytesMut};
use std::io::{Result, Write};

fn write_labels(mut w: impl Write, header: &str, labels: &Entries<Label>) -> Result<()> {
    writeln!(w, "{header}")?;
    for l in &labels.entries {
        writeln!(w, "{} {}", l.index, l.text)?;
    }
    Ok(())
}

impl HubMessage {
    /// Write one serialized block, including the terminating empty line.
    pub fn write_serialized(&self, mut w: impl Write) -> Result<()> {
        match self {
            HubMessage::ProtocolPreamble(p) => {
                writeln!(w, "PROTOCOL PREAMBLE:")?;
                writeln!(w, "Version: {}", p.version)?;
            }
            HubMessage::DeviceInfo(d) => {
                writeln!(w, "VIDEOHUB DEVICE:")?;
                if let Some(present) = d.present {
                    writeln!(w, "Device present: {}", present)?;
                }
                if let Some(model) = &d.model_name {
                    writeln!(w, "Model name: {}", model)?;
                }
                if let Some(name) = &d.friendly_name {
                    writeln!(w, "Friendly name: {}", name)?;
                }
                if let Some(id) = &d.unique_id {
                    writeln!(w, "Unique ID: {}", id)?;
                }
                if let Some(inputs) = d.video_inputs {
                    writeln!(w, "Video inputs: {}", inputs)?;
                }
                if let Some(outputs) = d.video_outputs {
                    writeln!(w, "Video outputs: {}", outputs)?;
                }
            }
            HubMessage::InputLabels(ls) => write_labels(&mut w, "INPUT LABELS:", ls)?,
            HubMessage::OutputLabels(ls) => write_labels(&mut w, "OUTPUT LABELS:", ls)?,
            HubMessage::OutputRouting(rs) => {
                writeln!(w, "VIDEO OUTPUT ROUTING:")?;
                for r in &rs.entries {
                    writeln!(w, "{} {}", r.dest, r.src)?;
                }
            }
            HubMessage::OutputLocks(ls) => {
                writeln!(w, "VIDEO OUTPUT LOCKS:")?;
                for l in &ls.entries {
                    writeln!(w, "{} {}", l.dest, l.state)?;
                }
            }
            HubMessage::Configuration(settings) => {
                writeln!(w, "CONFIGURATION:")?;
                for s in settings {
                    writeln!(w, "{}: {}", s.name, s.value)?;
                }
            }
            HubMessage::Ping => writeln!(w, "PING:")?,
            HubMessage::Ack => writeln!(w, "ACK")?,
            HubMessage::Nak => writeln!(w, "NAK")?,
            HubMessage::EndPrelude => writeln!(w, "END PRELUDE:")?,
            HubMessage::Unknown { header, body } => {
                writeln!(w, "{}", header)?;
                for line in body {
                    writeln!(w, "{}", line)?;
                }
            }
        }
        // terminating empty line
        writeln!(w)?;
        Ok(())
    }

    pub fn to_serialized(&self) -> Result<BytesMut> {
        let mut w = BytesMut::new().writer();
        self.write_serialized(&mut w)?;
        Ok(w.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: HubMessage) {
        let bytes = msg.to_serialized().unwrap();
        let (rem, parsed) = HubMessage::parse_block(&bytes).unwrap();
        assert!(rem.is_empty(), "leftover {:?}", rem);
        assert_eq!(msg, parsed);
    }

    #[test]
    fn roundtrip_each_kind() {
        roundtrip(HubMessage::ProtocolPreamble(Preamble {
            version: "2.7".into(),
        }));
        roundtrip(HubMessage::DeviceInfo(DeviceInfo {
            present: Some(true),
            model_name: Some("Smart Videohub 12x12".into()),
            friendly_name: Some("Studio Hub".into()),
            unique_id: Some("0A1B2C".into()),
            video_inputs: Some(12),
            video_outputs: Some(12),
        }));
        roundtrip(HubMessage::InputLabels(
            vec![
                Label {
                    index: 0,
                    text: "Camera 1".into(),
                },
                Label {
                    index: 1,
                    text: "".into(),
                },
            ]
            .into(),
        ));
        roundtrip(HubMessage::OutputLabels(
            vec![Label {
                index: 3,
                text: "Multiview".into(),
            }]
            .into(),
        ));
        roundtrip(HubMessage::OutputRouting(
            vec![Route { dest: 3, src: 7 }].into(),
        ));
        roundtrip(HubMessage::OutputLocks(
            vec![
                LockEntry {
                    dest: 0,
                    state: LockState::Owned,
                },
                LockEntry {
                    dest: 1,
                    state: LockState::Unlocked,
                },
            ]
            .into(),
        ));
        roundtrip(HubMessage::Configuration(vec![Setting {
            name: "Take Mode".into(),
            value: "false".into(),
        }]));
        roundtrip(HubMessage::Ping);
        roundtrip(HubMessage::Ack);
        roundtrip(HubMessage::Nak);
        roundtrip(HubMessage::EndPrelude);
    }

    #[test]
    fn serialized_scenario_bytes() {
        // the exact bytes a route-change broadcast puts on the wire
        let msg = HubMessage::OutputRouting(vec![Route { dest: 3, src: 7 }].into());
        assert_eq!(&msg.to_serialized().unwrap()[..], b"VIDEO OUTPUT ROUTING:\n3 7\n\n");

        assert_eq!(&HubMessage::Ack.to_serialized().unwrap()[..], b"ACK\n\n");
    }
}
