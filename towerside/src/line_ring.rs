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

//! The Tower-side sequence-numbered line buffer used for UI
//! resume-by-seq (spec §3, §4.6.2). Distinct from the shellper's
//! Raw-byte Ring: this one is split into lines and tagged with a
//! strictly monotonic sequence number so a reconnecting UI client can
//! ask "give me everything after seq N".

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqLine {
    pub seq: u64,
    pub line: String,
}

pub struct LineRing {
    lines: VecDeque<SeqLine>,
    capacity: usize,
    next_seq: u64,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        LineRing { lines: VecDeque::new(), capacity, next_seq: 1 }
    }

    pub fn highest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Push one line, assigning it the next sequence number.
    pub fn push(&mut self, line: String) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.lines.push_back(SeqLine { seq, line });
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        seq
    }

    /// Full current contents, oldest first.
    pub fn all(&self) -> Vec<SeqLine> {
        self.lines.iter().cloned().collect()
    }

    /// Every resident line with `seq > since`, clamped to the oldest
    /// surviving line if `since` predates what we still hold
    /// (best-effort resume, spec §4.6.2).
    pub fn get_since(&self, since: u64) -> Vec<SeqLine> {
        self.lines.iter().filter(|l| l.seq > since).cloned().collect()
    }
}
