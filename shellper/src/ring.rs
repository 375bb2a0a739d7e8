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

//! A bounded FIFO of raw byte chunks. We evict whole lines, not whole
//! chunks, so bytes are never touched except at the very head or tail
//! -- escape sequences that straddle a newline are never corrupted by
//! this ring, unlike a line-oriented buffer would be.

use std::collections::VecDeque;

const NEWLINE: u8 = 0x0a;

/// Raw-byte replay buffer. Bounded by line count, not byte count --
/// see spec §4.2 for the eviction rule this implements.
pub struct RawByteRing {
    chunks: VecDeque<Vec<u8>>,
    max_lines: usize,
    bytes: usize,
    line_count: usize,
}

impl RawByteRing {
    pub fn new(max_lines: usize) -> Self {
        RawByteRing { chunks: VecDeque::new(), max_lines, bytes: 0, line_count: 0 }
    }

    pub fn bytes_len(&self) -> usize {
        self.bytes
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Drop all buffered content. Used when a `SPAWN` replaces the PTY.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
        self.line_count = 0;
    }

    /// Append a chunk of raw PTY output and restore the `lineCount <=
    /// maxLines` invariant by evicting from the head.
    pub fn append(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let newlines = count_newlines(buf);
        self.bytes += buf.len();
        self.line_count += newlines;
        self.chunks.push_back(buf.to_vec());
        self.evict();
    }

    fn evict(&mut self) {
        while self.line_count > self.max_lines && self.chunks.len() > 1 {
            let oldest = self.chunks.pop_front().expect("len > 1 checked above");
            self.bytes -= oldest.len();
            self.line_count -= count_newlines(&oldest);
        }
        if self.line_count > self.max_lines {
            if let Some(chunk) = self.chunks.front_mut() {
                let to_remove = self.line_count - self.max_lines;
                if let Some(cut) = nth_newline_end(chunk, to_remove) {
                    let removed_bytes = cut;
                    let removed_newlines = to_remove;
                    chunk.drain(..cut);
                    self.bytes -= removed_bytes;
                    self.line_count -= removed_newlines;
                }
            }
        }
    }

    /// Returns a single contiguous copy of everything currently held.
    pub fn get_replay_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

fn count_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == NEWLINE).count()
}

/// Returns the byte index just past the `n`th newline in `buf`
/// (1-indexed), or `None` if `buf` has fewer than `n` newlines.
fn nth_newline_end(buf: &[u8], n: usize) -> Option<usize> {
    if n == 0 {
        return Some(0);
    }
    let mut seen = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == NEWLINE {
            seen += 1;
            if seen == n {
                return Some(i + 1);
            }
        }
    }
    None
}
