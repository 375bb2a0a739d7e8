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

//! Forking a PTY-backed child process and talking to its master side.
//!
//! Built directly on the `pty` crate's `Fork` (a thin wrapper around
//! `fork(2)` + `openpty`-equivalent `/dev/ptmx` handling): the parent
//! keeps the `Master` end, the child execs the requested command with
//! its slave dup'd onto stdin/stdout/stderr.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use anyhow::{anyhow, Context};
use pty::fork::Fork;

use crate::consts::DEFAULT_TERM;

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtySize {
    pub cols: u16,
    pub rows: u16,
}

impl TtySize {
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size =
            libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };
        unsafe {
            tiocswinsz(fd, &term_size).context("setting tty size")?;
        }
        Ok(())
    }
}

/// What to exec inside the PTY: used for both the initial spawn and
/// every subsequent `SPAWN`-triggered respawn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub size: TtySize,
}

/// A running PTY-backed child process.
pub struct PtyProcess {
    fork: Fork,
    pid: libc::pid_t,
    size: TtySize,
}

impl PtyProcess {
    pub fn spawn(spec: &SpawnSpec) -> anyhow::Result<Self> {
        let fork = Fork::from_ptmx().map_err(|e| anyhow!("forking pty: {e:?}"))?;
        match fork {
            Fork::Parent(pid, ref master) => {
                let fd = master.as_raw_fd();
                spec.size.set_fd(fd).context("sizing new pty")?;
                Ok(PtyProcess { fork, pid, size: spec.size })
            }
            Fork::Child(_) => {
                // We are the child: the slave side is already dup'd onto
                // stdin/stdout/stderr and we are the session leader.
                std::env::set_var("TERM", DEFAULT_TERM);
                for (k, v) in &spec.env {
                    std::env::set_var(k, v);
                }
                if let Some(cwd) = &spec.cwd {
                    std::env::set_current_dir(cwd)
                        .unwrap_or_else(|e| eprintln!("shellper: chdir {cwd}: {e}"));
                }
                let err = Command::new(&spec.command).args(&spec.args).exec();
                // `exec` only returns on failure.
                eprintln!("shellper: exec {} failed: {err}", spec.command);
                std::process::exit(127);
            }
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn size(&self) -> TtySize {
        self.size
    }

    pub fn master_fd(&self) -> anyhow::Result<RawFd> {
        match &self.fork {
            Fork::Parent(_, master) => Ok(master.as_raw_fd()),
            Fork::Child(_) => Err(anyhow!("not the parent side of this fork")),
        }
    }

    pub fn resize(&mut self, size: TtySize) -> anyhow::Result<()> {
        let fd = self.master_fd()?;
        size.set_fd(fd)?;
        self.size = size;
        Ok(())
    }

    /// Send a signal to the child process group leader.
    pub fn signal(&self, sig: i32) -> anyhow::Result<()> {
        let ret = unsafe { libc::kill(self.pid, sig) };
        if ret != 0 {
            return Err(io::Error::last_os_error()).context("sending signal to pty child");
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.fork {
            Fork::Parent(_, master) => io::Read::read(master, buf),
            Fork::Child(_) => Err(io::Error::new(io::ErrorKind::Other, "not the parent side")),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.fork {
            Fork::Parent(_, master) => io::Write::write(master, buf),
            Fork::Child(_) => Err(io::Error::new(io::ErrorKind::Other, "not the parent side")),
        }
    }

    /// Non-blocking check for child exit. Returns `Some((code, signal))`
    /// once the child has exited, `None` if it is still running.
    pub fn try_wait(&self) -> anyhow::Result<Option<(Option<i32>, Option<i32>)>> {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        if ret == 0 {
            return Ok(None);
        }
        if ret < 0 {
            return Err(io::Error::last_os_error()).context("waitpid");
        }
        if libc::WIFEXITED(status) {
            Ok(Some((Some(libc::WEXITSTATUS(status)), None)))
        } else if libc::WIFSIGNALED(status) {
            Ok(Some((None, Some(libc::WTERMSIG(status)))))
        } else {
            Ok(None)
        }
    }
}
