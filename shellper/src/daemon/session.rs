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

//! The shellper's in-memory state: the PTY, its replay ring, and the
//! set of registered client connections. A `SPAWN` replaces the PTY
//! "by identity" -- each PTY gets a monotonic generation number, and
//! any in-flight read/exit from a stale generation is discarded
//! rather than corrupting the new one (spec §4.3.5).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use anyhow::{anyhow, Context};
use crossbeam_channel::Sender;
use nix::poll::{poll, PollFd, PollFlags};
use shellper_protocol::{ClientType, Exit, Frame, Welcome, ALLOWED_SIGNALS, PROTOCOL_VERSION};
use tracing::{info, instrument, warn};

use crate::consts::{PTY_POLL_MS, PTY_READ_BUF_SIZE};
use crate::errors::DaemonError;
use crate::pty::{PtyProcess, SpawnSpec, TtySize};
use crate::ring::RawByteRing;
use crate::test_hooks;

pub struct ConnectionHandle {
    pub sender: Sender<Frame>,
    pub client_type: ClientType,
}

struct GenerationFd {
    generation: u64,
    fd: RawFd,
}

pub struct ShellperSession {
    pty: Mutex<PtyProcess>,
    ring: Mutex<RawByteRing>,
    generation: AtomicU64,
    current_fd: Mutex<GenerationFd>,
    exited: AtomicBool,
    start_time_ms: i64,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_conn_id: AtomicU64,
    /// Lets `&self` methods (e.g. `respawn`) hand the PTY reader
    /// thread an owning `Arc<Self>`; stable Rust has no `self:
    /// &Arc<Self>` receiver to do this directly.
    self_weak: Weak<ShellperSession>,
}

impl ShellperSession {
    pub fn spawn(
        spec: SpawnSpec,
        replay_buffer_lines: usize,
        start_time_ms: i64,
    ) -> anyhow::Result<Arc<Self>> {
        let pty = PtyProcess::spawn(&spec).context("spawning initial pty")?;
        let fd = pty.master_fd().context("reading initial pty fd")?;
        let session = Arc::new_cyclic(|weak_self| ShellperSession {
            pty: Mutex::new(pty),
            ring: Mutex::new(RawByteRing::new(replay_buffer_lines)),
            generation: AtomicU64::new(0),
            current_fd: Mutex::new(GenerationFd { generation: 0, fd }),
            exited: AtomicBool::new(false),
            start_time_ms,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            self_weak: weak_self.clone(),
        });
        spawn_pty_reader(session.clone(), 0);
        Ok(session)
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pty.lock().expect("pty mutex poisoned").pid()
    }

    pub fn size(&self) -> TtySize {
        self.pty.lock().expect("pty mutex poisoned").size()
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn welcome(&self) -> Welcome {
        let size = self.size();
        Welcome {
            version: PROTOCOL_VERSION,
            pid: self.pid(),
            cols: size.cols,
            rows: size.rows,
            start_time: self.start_time_ms,
        }
    }

    pub fn replay_frame(&self) -> Option<Frame> {
        let ring = self.ring.lock().expect("ring mutex poisoned");
        if ring.is_empty() {
            None
        } else {
            Some(Frame::Replay(ring.get_replay_data()))
        }
    }

    /// Register a new connection. If it claims `clientType = tower`,
    /// any existing tower connection is destroyed first (spec §3: "at
    /// most one entry has clientType = tower").
    pub fn register_connection(&self, client_type: ClientType, sender: Sender<Frame>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let mut conns = self.connections.lock().expect("connections mutex poisoned");
        if client_type == ClientType::Tower {
            conns.retain(|_, h| h.client_type != ClientType::Tower);
        }
        conns.insert(id, ConnectionHandle { sender, client_type });
        let count = conns.len();
        drop(conns);
        test_hooks::emit("connection-registered");
        test_hooks::emit_status(count, self.ring.lock().expect("ring mutex poisoned").line_count());
        id
    }

    pub fn remove_connection(&self, id: u64) {
        let count = {
            let mut conns = self.connections.lock().expect("connections mutex poisoned");
            conns.remove(&id);
            conns.len()
        };
        test_hooks::emit("connection-removed");
        test_hooks::emit_status(count, self.ring.lock().expect("ring mutex poisoned").line_count());
    }

    pub fn connection_client_type(&self, id: u64) -> Option<ClientType> {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .get(&id)
            .map(|h| h.client_type)
    }

    /// Broadcast a frame to every registered connection. A connection
    /// whose mailbox is full or gone is dropped -- the slow client is
    /// evicted, the PTY is never stalled (spec §4.3.3, §8 invariant 5).
    pub fn broadcast(&self, frame: Frame) {
        let mut conns = self.connections.lock().expect("connections mutex poisoned");
        conns.retain(|id, handle| match handle.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(_) => {
                let e = DaemonError::BackpressureDrop { connection_id: *id };
                warn!("{e}");
                false
            }
        });
    }

    /// Send a frame to exactly one connection (used for `PING` ->
    /// `PONG`, which is a point-to-point reply, not a broadcast).
    pub fn send_to(&self, id: u64, frame: Frame) {
        let conns = self.connections.lock().expect("connections mutex poisoned");
        if let Some(handle) = conns.get(&id) {
            let _ = handle.sender.try_send(frame);
        }
    }

    pub fn write_data(&self, buf: &[u8]) {
        if self.has_exited() {
            return;
        }
        let mut pty = self.pty.lock().expect("pty mutex poisoned");
        if let Err(e) = pty.write(buf) {
            warn!("writing to pty: {e}");
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let mut pty = self.pty.lock().expect("pty mutex poisoned");
        if let Err(e) = pty.resize(TtySize { cols, rows }) {
            warn!("resizing pty: {e}");
        }
    }

    /// `SIGNAL` is tower-only; callers must check `connection_client_type`
    /// before calling this. Returns `false` if the signal number is not
    /// in the allowlist (the caller should emit a protocol-error event
    /// without destroying the connection, per spec §4.3.2).
    pub fn signal(&self, num: u32) -> bool {
        if !ALLOWED_SIGNALS.contains(&num) {
            return false;
        }
        if self.has_exited() {
            return true;
        }
        let pty = self.pty.lock().expect("pty mutex poisoned");
        if let Err(e) = pty.signal(num as i32) {
            warn!("sending signal {num}: {e}");
        }
        true
    }

    /// `SPAWN` is tower-only. Kills the current PTY, clears the ring,
    /// and starts a fresh PTY generation with the requested command.
    #[instrument(skip_all)]
    pub fn respawn(&self, spec: SpawnSpec) -> anyhow::Result<()> {
        let new_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let pty = self.pty.lock().expect("pty mutex poisoned");
            let _ = pty.signal(libc::SIGTERM);
        }
        self.ring.lock().expect("ring mutex poisoned").clear();
        self.exited.store(false, Ordering::SeqCst);

        let new_pty = PtyProcess::spawn(&spec).context("spawning replacement pty")?;
        let new_fd = new_pty.master_fd().context("reading replacement pty fd")?;
        {
            let mut pty = self.pty.lock().expect("pty mutex poisoned");
            *pty = new_pty;
        }
        {
            let mut fd_slot = self.current_fd.lock().expect("fd mutex poisoned");
            *fd_slot = GenerationFd { generation: new_generation, fd: new_fd };
        }
        info!(new_generation, "spawned replacement pty");
        test_hooks::emit("pty-respawned");
        let session = self.self_weak.upgrade().expect("session outlives its own method call");
        spawn_pty_reader(session, new_generation);
        Ok(())
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Owns the PTY-output-to-ring-to-fan-out path for a single generation.
/// Exits silently (no `EXIT` broadcast, no ring mutation) the moment it
/// notices its generation has been superseded by a `SPAWN`.
fn spawn_pty_reader(session: std::sync::Arc<ShellperSession>, generation: u64) {
    thread::Builder::new()
        .name(format!("pty-reader-gen{generation}"))
        .spawn(move || run_pty_reader(session, generation))
        .expect("spawning pty reader thread");
}

fn run_pty_reader(session: std::sync::Arc<ShellperSession>, generation: u64) {
    let fd = {
        let fd_slot = session.current_fd.lock().expect("fd mutex poisoned");
        if fd_slot.generation != generation {
            return;
        }
        fd_slot.fd
    };

    let mut buf = vec![0u8; PTY_READ_BUF_SIZE];
    loop {
        if !session.is_current_generation(generation) {
            return;
        }

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = match poll(&mut fds, PTY_POLL_MS) {
            Ok(n) => n,
            Err(e) => {
                warn!("polling pty fd: {e}");
                return;
            }
        };
        if ready == 0 {
            continue;
        }

        let n = {
            let mut pty = session.pty.lock().expect("pty mutex poisoned");
            pty.read(&mut buf)
        };

        // Re-check generation *after* the blocking syscall: a delayed
        // read from a PTY that was just replaced by SPAWN must not
        // touch the new generation's ring or connection set.
        if !session.is_current_generation(generation) {
            return;
        }

        match n {
            Ok(0) => {
                handle_pty_exit(&session, generation);
                return;
            }
            Ok(len) => {
                let ring_lines = {
                    let mut ring = session.ring.lock().expect("ring mutex poisoned");
                    ring.append(&buf[..len]);
                    ring.line_count()
                };
                session.broadcast(Frame::Data(buf[..len].to_vec()));
                test_hooks::emit_status(
                    session.connections.lock().expect("connections mutex poisoned").len(),
                    ring_lines,
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => {
                handle_pty_exit(&session, generation);
                return;
            }
        }
    }
}

fn handle_pty_exit(session: &std::sync::Arc<ShellperSession>, generation: u64) {
    if !session.is_current_generation(generation) {
        return;
    }
    let (code, signal) = {
        let pty = session.pty.lock().expect("pty mutex poisoned");
        pty.try_wait().unwrap_or(None).unwrap_or((None, None))
    };
    if !session.is_current_generation(generation) {
        return;
    }
    session.exited.store(true, Ordering::SeqCst);
    session.broadcast(Frame::Exit(Exit { code, signal }));
    test_hooks::emit("pty-exited");
}

/// Used by the daemon's connection handler to translate a `SPAWN`
/// frame payload into a `SpawnSpec`, preserving the current terminal
/// size as the spec requires.
pub fn spawn_spec_from(
    command: String,
    args: Vec<String>,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    size: TtySize,
) -> SpawnSpec {
    SpawnSpec { command, args, cwd, env, size }
}

/// Translate a malformed-signal request into the same protocol-error
/// shape used elsewhere; kept here because the allowlist check lives
/// alongside `ShellperSession::signal`.
pub fn reject_disallowed_signal(num: u32) -> anyhow::Error {
    anyhow!("signal {num} is not in the allowed set {:?}", ALLOWED_SIGNALS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::TtySize;

    fn cat_session() -> std::sync::Arc<ShellperSession> {
        let spec = SpawnSpec {
            command: "/bin/cat".into(),
            args: vec![],
            cwd: None,
            env: vec![],
            size: TtySize { cols: 80, rows: 24 },
        };
        ShellperSession::spawn(spec, 1000, 0).expect("spawning /bin/cat pty")
    }

    /// S4: a single slow client is evicted on backpressure; the PTY
    /// and every other connection keep running (spec §4.3.3, §8).
    #[test]
    fn backpressure_drops_only_the_slow_connection() {
        let session = cat_session();

        let (slow_tx, slow_rx) = crossbeam_channel::bounded::<Frame>(1);
        let slow_id = session.register_connection(ClientType::Terminal, slow_tx);
        // Fill the slow connection's mailbox without ever draining it.
        session.broadcast(Frame::Data(b"fill".to_vec()));

        let (fast_tx, fast_rx) = crossbeam_channel::bounded::<Frame>(16);
        let fast_id = session.register_connection(ClientType::Terminal, fast_tx);

        // This broadcast finds the slow mailbox still full and evicts it.
        session.broadcast(Frame::Data(b"second".to_vec()));

        assert_eq!(session.connection_client_type(slow_id), None, "slow connection evicted");
        assert_eq!(session.connection_client_type(fast_id), Some(ClientType::Terminal));
        assert!(!session.has_exited(), "pty must survive a backpressure eviction");

        drop(slow_rx);
        drop(fast_rx);
        let _ = session.signal(libc::SIGKILL);
    }

    /// S5-adjacent: a disallowed signal number is rejected without
    /// tearing down the connection or the pty.
    #[test]
    fn disallowed_signal_is_rejected_without_side_effects() {
        let session = cat_session();
        assert!(!session.signal(9999));
        assert!(!session.has_exited());
        let _ = session.signal(libc::SIGKILL);
    }

    /// S3: a `SPAWN` racing the old PTY's exit must not resurrect the
    /// old generation. A late `handle_pty_exit` call for a generation
    /// that's already been superseded is a silent no-op: `hasExited`
    /// stays false and no `EXIT` frame reaches clients (spec §4.3.5, §8).
    #[test]
    fn respawn_racing_old_pty_exit_leaves_session_alive() {
        let session = cat_session();
        let (tx, rx) = crossbeam_channel::bounded::<Frame>(16);
        session.register_connection(ClientType::Terminal, tx);

        let spec = SpawnSpec {
            command: "/bin/cat".into(),
            args: vec![],
            cwd: None,
            env: vec![],
            size: TtySize { cols: 80, rows: 24 },
        };
        session.respawn(spec).expect("respawn");

        // The old generation's exit callback arrives after the respawn
        // already moved the session to generation 1.
        handle_pty_exit(&session, 0);

        assert!(!session.has_exited(), "a stale generation's exit must not mark the session exited");
        assert!(
            rx.try_iter().all(|f| !matches!(f, Frame::Exit(_))),
            "no EXIT frame should be broadcast for a superseded generation"
        );

        let _ = session.signal(libc::SIGKILL);
    }

    /// Respawning bumps the generation; a stale generation's reader
    /// must not be able to report itself as current again.
    #[test]
    fn respawn_bumps_generation_and_clears_ring() {
        let session = cat_session();
        session.ring.lock().unwrap().append(b"leftover scrollback\n");
        assert!(!session.ring.lock().unwrap().is_empty());

        let spec = SpawnSpec {
            command: "/bin/cat".into(),
            args: vec![],
            cwd: None,
            env: vec![],
            size: TtySize { cols: 80, rows: 24 },
        };
        session.respawn(spec).expect("respawn");

        assert!(session.ring.lock().unwrap().is_empty(), "respawn clears the replay ring");
        assert!(!session.is_current_generation(0), "generation 0 is now stale");
        assert!(session.is_current_generation(1));
        let _ = session.signal(libc::SIGKILL);
    }
}
