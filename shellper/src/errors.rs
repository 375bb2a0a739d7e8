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

//! The error taxonomy the shellper daemon itself needs to branch on.
//! Everything else crosses function boundaries as `anyhow::Error`.

use std::fmt;

use shellper_protocol::ProtocolError;

#[derive(Debug)]
pub enum DaemonError {
    /// A connection sent a malformed or oversized frame. The
    /// connection that produced it is destroyed; nothing else is
    /// affected.
    Protocol(ProtocolError),
    /// A connection's outbound mailbox was full or the socket was
    /// gone; that connection is dropped, the PTY keeps running.
    BackpressureDrop { connection_id: u64 },
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Protocol(e) => write!(f, "protocol error: {e}"),
            DaemonError::BackpressureDrop { connection_id } => {
                write!(f, "dropped slow connection {connection_id} (backpressure)")
            }
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Protocol(e) => Some(e),
            DaemonError::BackpressureDrop { .. } => None,
        }
    }
}

impl From<ProtocolError> for DaemonError {
    fn from(e: ProtocolError) -> Self {
        DaemonError::Protocol(e)
    }
}
