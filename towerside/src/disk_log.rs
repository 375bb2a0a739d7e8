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

//! The session wrapper's disk transcript: `<id>.log` plus a single
//! prior rotation `<id>.log.1` (spec §6, §9 -- "behavior beyond that
//! is the OS's concern").

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;

pub struct DiskLog {
    path: PathBuf,
    rotated_path: PathBuf,
    rotate_at_bytes: u64,
    file: File,
    written: u64,
}

impl DiskLog {
    pub fn open(path: impl AsRef<Path>, rotate_at_bytes: u64) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rotated_path = rotated_sibling(&path);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(DiskLog { path, rotated_path, rotate_at_bytes, file, written })
    }

    pub fn append(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        if self.written >= self.rotate_at_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, &self.rotated_path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn rotated_sibling(path: &Path) -> PathBuf {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    PathBuf::from(rotated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_and_rotates_at_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut log = DiskLog::open(&path, 16).unwrap();
        log.append(b"0123456789").unwrap();
        assert!(!rotated_sibling(&path).exists());
        log.append(b"0123456789").unwrap();
        assert!(rotated_sibling(&path).exists());
        assert!(path.exists());
    }

    #[test]
    fn reopen_picks_up_existing_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");
        {
            let mut log = DiskLog::open(&path, 1000).unwrap();
            log.append(b"hello").unwrap();
        }
        let log = DiskLog::open(&path, 1000).unwrap();
        assert_eq!(log.written, 5);
    }
}
