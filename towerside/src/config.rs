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

//! Session Manager configuration (spec §4.4), loaded from TOML the
//! same way the teacher's top-level `Config` is (`toml::from_str`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;

fn default_max_restarts() -> u32 {
    50
}
fn default_restart_delay_ms() -> u64 {
    2_000
}
fn default_restart_reset_after_ms() -> u64 {
    300_000
}
fn default_replay_buffer_lines() -> usize {
    10_000
}
fn default_stdout_timeout_ms() -> u64 {
    10_000
}
fn default_socket_appear_timeout_ms() -> u64 {
    5_000
}
fn default_socket_appear_poll_ms() -> u64 {
    50
}
fn default_term_wait_timeout_ms() -> u64 {
    5_000
}
fn default_term_wait_poll_ms() -> u64 {
    100
}
fn default_stale_probe_timeout_ms() -> u64 {
    2_000
}

#[derive(Deserialize, Debug, Clone)]
pub struct SessionManagerConfig {
    /// `.sockets/` directory root (spec §6). Socket paths and their
    /// companion stderr logs are resolved underneath it.
    pub sockets_dir: PathBuf,
    /// Path to the `shellper` binary the manager spawns.
    pub shellper_bin: PathBuf,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_restart_reset_after_ms")]
    pub restart_reset_after_ms: u64,
    #[serde(default = "default_replay_buffer_lines")]
    pub default_replay_buffer_lines: usize,

    #[serde(default = "default_stdout_timeout_ms")]
    pub stdout_timeout_ms: u64,
    #[serde(default = "default_socket_appear_timeout_ms")]
    pub socket_appear_timeout_ms: u64,
    #[serde(default = "default_socket_appear_poll_ms")]
    pub socket_appear_poll_ms: u64,
    #[serde(default = "default_term_wait_timeout_ms")]
    pub term_wait_timeout_ms: u64,
    #[serde(default = "default_term_wait_poll_ms")]
    pub term_wait_poll_ms: u64,
    #[serde(default = "default_stale_probe_timeout_ms")]
    pub stale_probe_timeout_ms: u64,
}

impl SessionManagerConfig {
    /// The clamp spec §4.4.3 and §9 require: the reset window can
    /// never close while a restart is still in flight.
    pub fn effective_restart_reset_after_ms(&self) -> u64 {
        self.restart_reset_after_ms.max(self.restart_delay_ms)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("parsing session manager config toml")
    }

    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn socket_path(&self, session_id: &str) -> PathBuf {
        self.sockets_dir.join(format!("shellper-{session_id}.sock"))
    }

    pub fn stderr_log_path(&self, session_id: &str) -> PathBuf {
        self.sockets_dir.join(format!("shellper-{session_id}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            sockets_dir = "/tmp/ws/.sockets"
            shellper_bin = "/usr/local/bin/shellper"
        "#;
        let cfg = SessionManagerConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.max_restarts, 50);
        assert_eq!(cfg.restart_delay_ms, 2_000);
        assert_eq!(cfg.restart_reset_after_ms, 300_000);
    }

    #[test]
    fn reset_after_is_clamped_to_restart_delay() {
        let raw = r#"
            sockets_dir = "/tmp/ws/.sockets"
            shellper_bin = "/usr/local/bin/shellper"
            restart_delay_ms = 9000
            restart_reset_after_ms = 1000
        "#;
        let cfg = SessionManagerConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.effective_restart_reset_after_ms(), 9000);
    }

    #[test]
    fn socket_and_log_paths_follow_naming_convention() {
        let raw = r#"
            sockets_dir = "/ws/.sockets"
            shellper_bin = "/usr/local/bin/shellper"
        "#;
        let cfg = SessionManagerConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.socket_path("abc"), PathBuf::from("/ws/.sockets/shellper-abc.sock"));
        assert_eq!(cfg.stderr_log_path("abc"), PathBuf::from("/ws/.sockets/shellper-abc.log"));
    }
}
