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

//! Wire format between a shellper daemon and its clients.
//!
//! A frame is `[1 byte type][4 byte big-endian length][payload]`. Frame
//! types whose payload is JSON (`Hello`, `Welcome`, `Resize`, `Signal`,
//! `Spawn`, `Exit`) carry a [`serde_json`]-encoded struct; `Data` and
//! `Replay` carry raw bytes; `Ping`/`Pong` carry nothing.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

pub mod parser;

pub use parser::FrameParser;

/// Current protocol version. Bumped only on wire-incompatible changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are a fatal protocol error.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Signals a `Signal` frame is allowed to carry.
pub const ALLOWED_SIGNALS: &[u32] = &[1, 2, 9, 15, 28];

/// A fully decoded frame, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(Hello),
    Welcome(Welcome),
    Data(Vec<u8>),
    Resize(Resize),
    Signal(Signal),
    Spawn(Spawn),
    Exit(Exit),
    Replay(Vec<u8>),
    Ping,
    Pong,
    /// A frame whose type tag we don't recognize. Kept (not dropped at
    /// the wire layer) so callers can log it; dispatch ignores it,
    /// per the forward-compatibility rule in the framing contract.
    Unknown(u8, Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Tower,
    Terminal,
}

impl Serialize for ClientType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            ClientType::Tower => "tower",
            ClientType::Terminal => "terminal",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for ClientType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "tower" => Ok(ClientType::Tower),
            "terminal" => Ok(ClientType::Terminal),
            other => Err(serde::de::Error::custom(format!("unknown clientType '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub version: u32,
    #[serde(rename = "clientType")]
    pub client_type: ClientType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    pub version: u32,
    pub pid: i32,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "startTime")]
    pub start_time: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    pub signal: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Spawn {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug)]
pub enum ProtocolError {
    /// A frame's declared payload length exceeded [`MAX_PAYLOAD_LEN`].
    OversizedFrame(u32),
    /// A frame that requires a JSON payload failed to parse.
    MalformedPayload { frame_type: u8, source: serde_json::Error },
    Io(io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::OversizedFrame(len) => {
                write!(f, "frame payload length {len} exceeds max of {MAX_PAYLOAD_LEN}")
            }
            ProtocolError::MalformedPayload { frame_type, source } => {
                write!(f, "malformed JSON payload for frame type 0x{frame_type:02x}: {source}")
            }
            ProtocolError::Io(e) => write!(f, "protocol io error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::MalformedPayload { source, .. } => Some(source),
            ProtocolError::Io(e) => Some(e),
            ProtocolError::OversizedFrame(_) => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

mod tag {
    pub const DATA: u8 = 0x01;
    pub const RESIZE: u8 = 0x02;
    pub const SIGNAL: u8 = 0x03;
    pub const EXIT: u8 = 0x04;
    pub const REPLAY: u8 = 0x05;
    pub const PING: u8 = 0x06;
    pub const PONG: u8 = 0x07;
    pub const HELLO: u8 = 0x08;
    pub const WELCOME: u8 = 0x09;
    pub const SPAWN: u8 = 0x0a;
}

impl Frame {
    /// The single-byte type tag for this frame.
    pub fn type_tag(&self) -> u8 {
        match self {
            Frame::Hello(_) => tag::HELLO,
            Frame::Welcome(_) => tag::WELCOME,
            Frame::Data(_) => tag::DATA,
            Frame::Resize(_) => tag::RESIZE,
            Frame::Signal(_) => tag::SIGNAL,
            Frame::Spawn(_) => tag::SPAWN,
            Frame::Exit(_) => tag::EXIT,
            Frame::Replay(_) => tag::REPLAY,
            Frame::Ping => tag::PING,
            Frame::Pong => tag::PONG,
            Frame::Unknown(t, _) => *t,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(match self {
            Frame::Hello(h) => serde_json::to_vec(h).map_err(|e| ProtocolError::MalformedPayload {
                frame_type: tag::HELLO,
                source: e,
            })?,
            Frame::Welcome(w) => {
                serde_json::to_vec(w).map_err(|e| ProtocolError::MalformedPayload {
                    frame_type: tag::WELCOME,
                    source: e,
                })?
            }
            Frame::Resize(r) => {
                serde_json::to_vec(r).map_err(|e| ProtocolError::MalformedPayload {
                    frame_type: tag::RESIZE,
                    source: e,
                })?
            }
            Frame::Signal(s) => {
                serde_json::to_vec(s).map_err(|e| ProtocolError::MalformedPayload {
                    frame_type: tag::SIGNAL,
                    source: e,
                })?
            }
            Frame::Spawn(s) => {
                serde_json::to_vec(s).map_err(|e| ProtocolError::MalformedPayload {
                    frame_type: tag::SPAWN,
                    source: e,
                })?
            }
            Frame::Exit(e0) => {
                serde_json::to_vec(e0).map_err(|e| ProtocolError::MalformedPayload {
                    frame_type: tag::EXIT,
                    source: e,
                })?
            }
            Frame::Data(b) | Frame::Replay(b) => b.clone(),
            Frame::Ping | Frame::Pong => Vec::new(),
            Frame::Unknown(_, b) => b.clone(),
        })
    }

    /// Write this frame to `w` as `[tag][be_u32 len][payload]`.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProtocolError> {
        let payload = self.payload()?;
        if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(ProtocolError::OversizedFrame(payload.len() as u32));
        }
        w.write_u8(self.type_tag())?;
        w.write_u32::<BigEndian>(payload.len() as u32)?;
        w.write_all(&payload)?;
        Ok(())
    }

    /// Read exactly one frame from `r`. Blocks until a full frame has
    /// arrived or the stream errors/closes.
    pub fn decode<R: Read>(r: &mut R) -> Result<Frame, ProtocolError> {
        let tag = r.read_u8()?;
        let len = r.read_u32::<BigEndian>()?;
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::OversizedFrame(len));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload)?;
        Frame::from_tag_and_payload(tag, payload)
    }

    fn from_tag_and_payload(tag_byte: u8, payload: Vec<u8>) -> Result<Frame, ProtocolError> {
        let parse_json = |bytes: &[u8]| {
            serde_json::from_slice(bytes)
                .map_err(|e| ProtocolError::MalformedPayload { frame_type: tag_byte, source: e })
        };
        Ok(match tag_byte {
            tag::HELLO => Frame::Hello(parse_json(&payload)?),
            tag::WELCOME => Frame::Welcome(parse_json(&payload)?),
            tag::DATA => Frame::Data(payload),
            tag::RESIZE => Frame::Resize(parse_json(&payload)?),
            tag::SIGNAL => Frame::Signal(parse_json(&payload)?),
            tag::SPAWN => Frame::Spawn(parse_json(&payload)?),
            tag::EXIT => Frame::Exit(parse_json(&payload)?),
            tag::REPLAY => Frame::Replay(payload),
            tag::PING => Frame::Ping,
            tag::PONG => Frame::Pong,
            other => Frame::Unknown(other, payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(f: Frame) {
        let mut buf = Vec::new();
        f.encode(&mut buf).expect("encode");
        let mut cursor = io::Cursor::new(buf);
        let decoded = Frame::decode(&mut cursor).expect("decode");
        assert_eq!(f, decoded);
    }

    #[test]
    fn roundtrips_every_frame_family() {
        roundtrip(Frame::Hello(Hello { version: 1, client_type: ClientType::Tower }));
        roundtrip(Frame::Hello(Hello { version: 1, client_type: ClientType::Terminal }));
        roundtrip(Frame::Welcome(Welcome { version: 1, pid: 4242, cols: 80, rows: 24, start_time: 1234567 }));
        roundtrip(Frame::Data(b"hello world\n".to_vec()));
        roundtrip(Frame::Resize(Resize { cols: 120, rows: 40 }));
        roundtrip(Frame::Signal(Signal { signal: 15 }));
        roundtrip(Frame::Spawn(Spawn {
            command: "/bin/zsh".into(),
            args: vec!["-l".into()],
            cwd: Some("/tmp".into()),
            env: vec![("PATH".into(), "/bin:/usr/bin".into())],
        }));
        roundtrip(Frame::Exit(Exit { code: Some(0), signal: None }));
        roundtrip(Frame::Exit(Exit { code: None, signal: Some(9) }));
        roundtrip(Frame::Replay(b"some replayed bytes".to_vec()));
        roundtrip(Frame::Ping);
        roundtrip(Frame::Pong);
    }

    #[test]
    fn empty_data_frame_roundtrips() {
        roundtrip(Frame::Data(Vec::new()));
    }

    #[test]
    fn unknown_frame_type_is_preserved_not_rejected() {
        let mut buf = Vec::new();
        buf.push(0x7f);
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = io::Cursor::new(buf);
        let decoded = Frame::decode(&mut cursor).expect("decode");
        assert_eq!(decoded, Frame::Unknown(0x7f, b"abc".to_vec()));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.push(tag::DATA);
        buf.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(buf);
        let err = Frame::decode(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedFrame(_)));
    }

    #[test]
    fn malformed_json_payload_is_rejected() {
        let mut buf = Vec::new();
        buf.push(tag::RESIZE);
        buf.extend_from_slice(&9u32.to_be_bytes());
        buf.extend_from_slice(b"not-json!");
        let mut cursor = io::Cursor::new(buf);
        let err = Frame::decode(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { frame_type, .. } if frame_type == tag::RESIZE));
    }

    #[test]
    fn signal_allowlist_matches_spec() {
        assert_eq!(ALLOWED_SIGNALS, &[1, 2, 9, 15, 28]);
    }
}
