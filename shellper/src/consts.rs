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

/// Default cap on the Raw-byte Ring if the spawn config omits one.
pub const DEFAULT_REPLAY_BUFFER_LINES: usize = 10_000;

/// How long the PTY-output reader polls for readiness before checking
/// whether it has been asked to shut down.
pub const PTY_POLL_MS: i32 = 100;

/// Read buffer size for PTY output.
pub const PTY_READ_BUF_SIZE: usize = 16 * 1024;

/// Directory mode for the socket's parent directory.
pub const SOCKET_DIR_MODE: u32 = 0o700;

/// File mode for the listening socket once bound.
pub const SOCKET_FILE_MODE: u32 = 0o600;

pub const DEFAULT_TERM: &str = "xterm-256color";
