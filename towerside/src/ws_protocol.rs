// Copyright 2024 Cloudtop Connectivity Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire codec for the UI-facing WebSocket sub-protocol (spec §4.6.4).
//! Distinct from the shellper wire: just a 1-byte tag, no length
//! prefix (the hosting WebSocket framing already delimits messages).

use serde_derive::{Deserialize, Serialize};

const TAG_CONTROL: u8 = 0x00;
const TAG_DATA: u8 = 0x01;

#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Control(ControlMessage),
    Data(Vec<u8>),
}

/// Recognized control types. `resize`/`ping` originate from the UI;
/// `pong`/`seq` originate from the server (spec §4.6.4, §6).
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Ping,
    Pong,
    Seq { seq: u64 },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

#[derive(Serialize, Deserialize)]
struct SeqPayload {
    seq: u64,
}

impl WsFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            WsFrame::Data(bytes) => {
                let mut out = Vec::with_capacity(1 + bytes.len());
                out.push(TAG_DATA);
                out.extend_from_slice(bytes);
                out
            }
            WsFrame::Control(msg) => {
                let envelope = match msg {
                    ControlMessage::Resize { cols, rows } => Envelope {
                        kind: "resize".into(),
                        payload: serde_json::to_value(ResizePayload { cols: *cols, rows: *rows })
                            .expect("resize payload always serializes"),
                    },
                    ControlMessage::Ping => {
                        Envelope { kind: "ping".into(), payload: serde_json::Value::Null }
                    }
                    ControlMessage::Pong => {
                        Envelope { kind: "pong".into(), payload: serde_json::Value::Null }
                    }
                    ControlMessage::Seq { seq } => Envelope {
                        kind: "seq".into(),
                        payload: serde_json::to_value(SeqPayload { seq: *seq })
                            .expect("seq payload always serializes"),
                    },
                };
                let json = serde_json::to_vec(&envelope).expect("envelope always serializes");
                let mut out = Vec::with_capacity(1 + json.len());
                out.push(TAG_CONTROL);
                out.extend_from_slice(&json);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<WsFrame> {
        let (tag, rest) = bytes.split_first().ok_or_else(|| anyhow::anyhow!("empty ws frame"))?;
        match *tag {
            TAG_DATA => Ok(WsFrame::Data(rest.to_vec())),
            TAG_CONTROL => {
                let envelope: Envelope = serde_json::from_slice(rest)?;
                let msg = match envelope.kind.as_str() {
                    "resize" => {
                        let p: ResizePayload = serde_json::from_value(envelope.payload)?;
                        ControlMessage::Resize { cols: p.cols, rows: p.rows }
                    }
                    "ping" => ControlMessage::Ping,
                    "pong" => ControlMessage::Pong,
                    "seq" => {
                        let p: SeqPayload = serde_json::from_value(envelope.payload)?;
                        ControlMessage::Seq { seq: p.seq }
                    }
                    other => return Err(anyhow::anyhow!("unrecognized control type '{other}'")),
                };
                Ok(WsFrame::Control(msg))
            }
            other => Err(anyhow::anyhow!("unrecognized ws frame tag 0x{other:02x}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_roundtrips() {
        let f = WsFrame::Data(b"hello".to_vec());
        assert_eq!(WsFrame::decode(&f.encode()).unwrap(), f);
    }

    #[test]
    fn resize_control_frame_roundtrips() {
        let f = WsFrame::Control(ControlMessage::Resize { cols: 80, rows: 24 });
        assert_eq!(WsFrame::decode(&f.encode()).unwrap(), f);
    }

    #[test]
    fn seq_control_frame_roundtrips() {
        let f = WsFrame::Control(ControlMessage::Seq { seq: 4242 });
        assert_eq!(WsFrame::decode(&f.encode()).unwrap(), f);
    }

    #[test]
    fn ping_pong_roundtrip() {
        assert_eq!(
            WsFrame::decode(&WsFrame::Control(ControlMessage::Ping).encode()).unwrap(),
            WsFrame::Control(ControlMessage::Ping)
        );
        assert_eq!(
            WsFrame::decode(&WsFrame::Control(ControlMessage::Pong).encode()).unwrap(),
            WsFrame::Control(ControlMessage::Pong)
        );
    }

    #[test]
    fn unrecognized_tag_is_an_error() {
        assert!(WsFrame::decode(&[0x02, 1, 2, 3]).is_err());
    }
}
