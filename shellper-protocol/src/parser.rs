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

//! Incremental frame parser for feeding arbitrary-sized reads from a
//! socket; frames may straddle any number of `feed` calls.

use std::collections::VecDeque;

use crate::{Frame, ProtocolError, MAX_PAYLOAD_LEN};

const HEADER_LEN: usize = 1 + 4;

enum State {
    AwaitingHeader,
    AwaitingPayload { tag: u8, len: u32 },
}

/// A streaming decoder: push arbitrary byte chunks in with [`feed`],
/// pull completed frames out with [`next_frame`].
///
/// [`feed`]: FrameParser::feed
/// [`next_frame`]: FrameParser::next_frame
pub struct FrameParser {
    buf: VecDeque<u8>,
    state: State,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser { buf: VecDeque::new(), state: State::AwaitingHeader }
    }

    /// Append newly read bytes to the internal buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied());
    }

    /// Pop the next complete frame, if one has arrived. Returns
    /// `Ok(None)` when more bytes are needed. A malformed length prefix
    /// is a terminal error; the caller should destroy the connection.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let tag = self.buf.pop_front().expect("checked len");
                    let mut len_bytes = [0u8; 4];
                    for b in &mut len_bytes {
                        *b = self.buf.pop_front().expect("checked len");
                    }
                    let len = u32::from_be_bytes(len_bytes);
                    if len > MAX_PAYLOAD_LEN {
                        return Err(ProtocolError::OversizedFrame(len));
                    }
                    self.state = State::AwaitingPayload { tag, len };
                }
                State::AwaitingPayload { tag, len } => {
                    if self.buf.len() < len as usize {
                        return Ok(None);
                    }
                    let payload: Vec<u8> = self.buf.drain(..len as usize).collect();
                    self.state = State::AwaitingHeader;
                    let frame = Frame::decode(&mut std::io::Cursor::new(
                        [&tag.to_be_bytes()[..], &len.to_be_bytes()[..], &payload[..]].concat(),
                    ))?;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientType, Hello};

    fn encoded(f: &Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        f.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn parses_frame_delivered_in_one_chunk() {
        let f = Frame::Data(b"abc".to_vec());
        let mut p = FrameParser::new();
        p.feed(&encoded(&f));
        assert_eq!(p.next_frame().unwrap(), Some(f));
        assert_eq!(p.next_frame().unwrap(), None);
    }

    #[test]
    fn parses_frame_split_at_every_possible_byte_boundary() {
        let f = Frame::Hello(Hello { version: 1, client_type: ClientType::Tower });
        let bytes = encoded(&f);
        for split in 0..=bytes.len() {
            let mut p = FrameParser::new();
            p.feed(&bytes[..split]);
            assert_eq!(p.next_frame().unwrap(), None, "split at {split}");
            p.feed(&bytes[split..]);
            assert_eq!(p.next_frame().unwrap(), Some(f.clone()), "split at {split}");
        }
    }

    #[test]
    fn parses_multiple_frames_fed_as_one_blob() {
        let a = Frame::Ping;
        let b = Frame::Data(b"xyz".to_vec());
        let mut bytes = encoded(&a);
        bytes.extend(encoded(&b));
        let mut p = FrameParser::new();
        p.feed(&bytes);
        assert_eq!(p.next_frame().unwrap(), Some(a));
        assert_eq!(p.next_frame().unwrap(), Some(b));
        assert_eq!(p.next_frame().unwrap(), None);
    }

    #[test]
    fn parses_frames_fed_one_byte_at_a_time() {
        let f = Frame::Replay(b"replayed content here".to_vec());
        let bytes = encoded(&f);
        let mut p = FrameParser::new();
        let mut got = None;
        for byte in bytes {
            p.feed(&[byte]);
            if let Some(frame) = p.next_frame().unwrap() {
                got = Some(frame);
            }
        }
        assert_eq!(got, Some(f));
    }

    #[test]
    fn oversized_length_prefix_errors_without_payload() {
        let mut p = FrameParser::new();
        let mut header = vec![0x01u8];
        header.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        p.feed(&header);
        assert!(p.next_frame().is_err());
    }
}
