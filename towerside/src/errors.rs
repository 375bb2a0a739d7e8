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

//! The error taxonomy from spec §7. Callers that need to branch on
//! *which* failure happened match on [`SessionError`]; everything else
//! crosses a boundary as `anyhow::Error`.

use std::fmt;

#[derive(Debug)]
pub enum SessionError {
    /// Malformed frame, oversized frame, or bad JSON payload. The
    /// offending connection is destroyed; other connections and the
    /// shellper daemon itself are unaffected.
    Protocol(String),
    /// No `WELCOME` arrived in time, or the shellper's advertised
    /// version is older than ours.
    Handshake(String),
    /// The recorded `(pid, startTime)` did not match the live process
    /// at reconnect time.
    PidReuse { pid: libc::pid_t, recorded_start_time: i64, observed_start_time: Option<i64> },
    /// `createSession` failed: bad argv, socket never appeared, or the
    /// child exited before handshake.
    Spawn(String),
    /// The shellper socket closed unexpectedly without an `EXIT` frame.
    Liveness(String),
    /// A single client's write failed; only that client is dropped.
    BackpressureDrop { session_id: String },
    /// `restartCount` reached the configured maximum; no further
    /// restarts are attempted.
    MaxRestartsExhausted { session_id: String, restart_count: u32 },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            SessionError::Handshake(msg) => write!(f, "handshake error: {msg}"),
            SessionError::PidReuse { pid, recorded_start_time, observed_start_time } => write!(
                f,
                "pid {pid} reuse detected: recorded startTime {recorded_start_time}, observed {observed_start_time:?}"
            ),
            SessionError::Spawn(msg) => write!(f, "spawn error: {msg}"),
            SessionError::Liveness(msg) => write!(f, "liveness error: {msg}"),
            SessionError::BackpressureDrop { session_id } => {
                write!(f, "dropped a slow client of session {session_id}")
            }
            SessionError::MaxRestartsExhausted { session_id, restart_count } => write!(
                f,
                "session {session_id} exhausted its restart budget ({restart_count} restarts)"
            ),
        }
    }
}

impl std::error::Error for SessionError {}
