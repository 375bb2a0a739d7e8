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

//! The shellper's invocation config: a single JSON positional argument.

use serde_derive::{Deserialize, Serialize};

use crate::consts::DEFAULT_REPLAY_BUFFER_LINES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellperConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "socketPath")]
    pub socket_path: String,
    #[serde(rename = "replayBufferLines", default = "default_replay_buffer_lines")]
    pub replay_buffer_lines: usize,
}

fn default_replay_buffer_lines() -> usize {
    DEFAULT_REPLAY_BUFFER_LINES
}

impl ShellperConfig {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: ShellperConfig = serde_json::from_str(raw)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"{"command":"/bin/sh","cols":80,"rows":24,"socketPath":"/tmp/x.sock"}"#;
        let cfg = ShellperConfig::from_json(raw).unwrap();
        assert_eq!(cfg.command, "/bin/sh");
        assert!(cfg.args.is_empty());
        assert_eq!(cfg.replay_buffer_lines, DEFAULT_REPLAY_BUFFER_LINES);
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"{
            "command": "/bin/zsh",
            "args": ["-l"],
            "cwd": "/tmp",
            "env": [["PATH", "/bin:/usr/bin"]],
            "cols": 120,
            "rows": 40,
            "socketPath": "/tmp/shellper-abc.sock",
            "replayBufferLines": 500
        }"#;
        let cfg = ShellperConfig::from_json(raw).unwrap();
        assert_eq!(cfg.cwd.as_deref(), Some("/tmp"));
        assert_eq!(cfg.env, vec![("PATH".to_string(), "/bin:/usr/bin".to_string())]);
        assert_eq!(cfg.replay_buffer_lines, 500);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(ShellperConfig::from_json("not json").is_err());
    }
}
