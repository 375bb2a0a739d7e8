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

//! The Tower-side Session Manager (spec §4.4): spawns shellper
//! daemons, reconnects to ones that survived a Tower restart,
//! auto-restarts their PTYs on exit, garbage-collects abandoned
//! sockets, and kills sessions on request.
//!
//! Grounded on `libshpool::daemonize::maybe_fork_daemon` for the
//! detached-spawn-then-poll-for-socket shape, and on the
//! per-session generation counter in the teacher's old
//! `daemon/ttl_reaper.rs` for cancelling stale restart-reset timers
//! without an explicit cancellation handle.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use serde_derive::{Deserialize, Serialize};
use shellper_protocol::Spawn;
use tracing::{info, instrument, warn};

use crate::client::{Client, ClientEvent};
use crate::config::SessionManagerConfig;
use crate::errors::SessionError;
use crate::identity;

/// What to exec inside a session's PTY, and whether to auto-respawn
/// it when the PTY exits (spec §3: "optional restart policy").
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Arguments to [`SessionManager::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub session_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub restart_on_exit: bool,
    pub replay_buffer_lines: Option<usize>,
}

impl CreateSessionOptions {
    fn restart_policy(&self) -> Option<RestartPolicy> {
        if !self.restart_on_exit {
            return None;
        }
        Some(RestartPolicy {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        })
    }
}

/// Events the Session Manager reports about its own bookkeeping
/// (spec §4.4.1 step 7, §7). Distinct from [`ClientEvent`], which
/// carries the raw protocol traffic a caller forwards to a session
/// wrapper.
#[derive(Debug)]
pub enum SessionEvent {
    /// A managed session's PTY exited and a respawn was scheduled.
    Restarting { attempt: u32 },
    /// The session was removed from the map; it will not be acted on
    /// again until a fresh `create_session`/`reconnect_session` call.
    Removed(SessionError),
    /// Something went wrong that doesn't imply removal.
    Error(SessionError),
}

struct ManagedSession {
    client: Arc<Client>,
    socket_path: PathBuf,
    stderr_log_path: PathBuf,
    pid: libc::pid_t,
    start_time: i64,
    restart_policy: Option<RestartPolicy>,
    restart_count: u32,
    /// Bumped on every PTY exit; a pending restart-reset timer checks
    /// this before zeroing `restart_count` so a timer from a
    /// superseded restart cycle is a silent no-op (ttl_reaper's
    /// gen_id idiom, spec §4.4.3).
    reset_generation: u64,
}

/// The invocation JSON written to the shellper's argv (spec §4.3.1).
/// Field names mirror `shellper::config::ShellperConfig` exactly;
/// kept local rather than depending on the `shellper` crate, since
/// the two processes only agree on a wire contract, not a shared type.
#[derive(Serialize)]
struct ShellperInvocation {
    command: String,
    args: Vec<String>,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    cols: u16,
    rows: u16,
    #[serde(rename = "socketPath")]
    socket_path: String,
    #[serde(rename = "replayBufferLines", skip_serializing_if = "Option::is_none")]
    replay_buffer_lines: Option<usize>,
}

#[derive(Deserialize)]
struct StartupInfo {
    pid: i32,
    #[serde(rename = "startTime")]
    start_time: i64,
}

pub struct SessionManager {
    config: SessionManagerConfig,
    sessions: Mutex<HashMap<String, ManagedSession>>,
    shutting_down: AtomicBool,
    event_seq: AtomicU64,
    on_event: Box<dyn Fn(String, SessionEvent) + Send + Sync>,
    /// Lets `&self` methods hand background threads and dispatch
    /// closures an owning `Arc<Self>` without a `self: &Arc<Self>`
    /// receiver, which stable Rust doesn't support.
    self_weak: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        on_event: impl Fn(String, SessionEvent) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| SessionManager {
            config,
            sessions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            event_seq: AtomicU64::new(0),
            on_event: Box::new(on_event),
            self_weak: weak_self.clone(),
        })
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("manager outlives its own method call")
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().expect("sessions mutex poisoned").keys().cloned().collect()
    }

    fn emit(&self, session_id: &str, event: SessionEvent) {
        self.event_seq.fetch_add(1, Ordering::SeqCst);
        (self.on_event)(session_id.to_string(), event);
    }

    /// spec §4.4.1: spawn the shellper as a detached child, read its
    /// startup line, wait for its socket, and handshake. Rolls back
    /// (kills the child, unlinks the socket) on any failed step.
    #[instrument(skip(self, opts, event_sink), fields(session_id = %opts.session_id))]
    pub fn create_session(
        &self,
        opts: CreateSessionOptions,
        event_sink: impl Fn(ClientEvent) + Send + Sync + 'static,
    ) -> Result<shellper_protocol::Welcome, SessionError> {
        let socket_path = self.config.socket_path(&opts.session_id);
        let stderr_log_path = self.config.stderr_log_path(&opts.session_id);

        ensure_socket_dir(&socket_path)
            .map_err(|e| SessionError::Spawn(format!("preparing socket dir: {e:#}")))?;
        remove_stale_socket(&socket_path)
            .map_err(|e| SessionError::Spawn(format!("removing stale socket: {e:#}")))?;

        let invocation = ShellperInvocation {
            command: opts.command.clone(),
            args: opts.args.clone(),
            cwd: opts.cwd.clone(),
            env: opts.env.clone(),
            cols: opts.cols,
            rows: opts.rows,
            socket_path: socket_path.to_string_lossy().into_owned(),
            replay_buffer_lines: opts
                .replay_buffer_lines
                .or(Some(self.config.default_replay_buffer_lines)),
        };
        let invocation_json = serde_json::to_string(&invocation)
            .map_err(|e| SessionError::Spawn(format!("encoding shellper invocation: {e}")))?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_log_path)
            .map_err(|e| SessionError::Spawn(format!("opening stderr log: {e}")))?;

        let mut child = unsafe {
            Command::new(&self.config.shellper_bin)
                .arg(&invocation_json)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::from(log_file))
                // Detach from Tower's process group: a signal sent to
                // Tower's group (e.g. Ctrl-C in its terminal) must not
                // also land on the shellper.
                .pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                })
                .spawn()
        }
        .map_err(|e| SessionError::Spawn(format!("spawning shellper: {e}")))?;
        let pid = child.id() as libc::pid_t;

        let stdout = child.stdout.take().expect("stdout piped above");
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let result = match reader.read_line(&mut line) {
                Ok(0) => Err(anyhow::anyhow!("shellper closed stdout before writing startup line")),
                Ok(_) => serde_json::from_str::<StartupInfo>(line.trim())
                    .map_err(|e| anyhow::anyhow!("parsing startup line: {e}")),
                Err(e) => Err(anyhow::anyhow!("reading startup line: {e}")),
            };
            let _ = tx.send(result);
        });

        let startup = match rx.recv_timeout(Duration::from_millis(self.config.stdout_timeout_ms)) {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                kill_pid(pid);
                let _ = fs::remove_file(&socket_path);
                return Err(SessionError::Spawn(format!("bad startup line: {e:#}")));
            }
            Err(_) => {
                kill_pid(pid);
                let _ = fs::remove_file(&socket_path);
                return Err(SessionError::Spawn("timed out waiting for startup line".into()));
            }
        };

        // Reap the child eventually without blocking startup: we
        // don't `wait()` here (spec's "unref" step), but an unreaped
        // exited child is a zombie forever, so one background thread
        // per session does the reaping whenever it eventually exits.
        thread::spawn(move || {
            let _ = child.wait();
        });

        if let Err(e) = wait_for_socket(
            &socket_path,
            Duration::from_millis(self.config.socket_appear_timeout_ms),
            Duration::from_millis(self.config.socket_appear_poll_ms),
        ) {
            kill_pid(startup.pid);
            let _ = fs::remove_file(&socket_path);
            return Err(SessionError::Spawn(format!("socket never appeared: {e}")));
        }

        let manager = self.arc_self();
        let session_id = opts.session_id.clone();
        let connect_result = Client::connect(&socket_path, move |event| {
            manager.handle_client_event(&session_id, event, &event_sink)
        });
        let (client, welcome) = match connect_result {
            Ok(pair) => pair,
            Err(e) => {
                kill_pid(startup.pid);
                let _ = fs::remove_file(&socket_path);
                return Err(e);
            }
        };

        let session = ManagedSession {
            client,
            socket_path,
            stderr_log_path,
            pid: startup.pid,
            start_time: startup.start_time,
            restart_policy: opts.restart_policy(),
            restart_count: 0,
            reset_generation: 0,
        };
        self.sessions.lock().expect("sessions mutex poisoned").insert(opts.session_id, session);
        info!(pid = startup.pid, "session created");
        Ok(welcome)
    }

    /// spec §4.4.2: reattach to a shellper that survived a Tower
    /// restart, validating the `(pid, startTime)` identity tuple
    /// before trusting the socket at all.
    #[instrument(skip(self, restart_policy, event_sink), fields(%session_id))]
    pub fn reconnect_session(
        &self,
        session_id: String,
        socket_path: PathBuf,
        pid: libc::pid_t,
        start_time: i64,
        restart_policy: Option<RestartPolicy>,
        event_sink: impl Fn(ClientEvent) + Send + Sync + 'static,
    ) -> Result<shellper_protocol::Welcome, SessionError> {
        if !identity::is_alive(pid) {
            return Err(SessionError::Spawn(format!("pid {pid} is not alive")));
        }
        let observed = identity::get_process_start_time(pid);
        if !identity::matches(start_time, observed) {
            return Err(SessionError::PidReuse {
                pid,
                recorded_start_time: start_time,
                observed_start_time: observed,
            });
        }
        let meta = fs::symlink_metadata(&socket_path)
            .map_err(|e| SessionError::Spawn(format!("statting socket: {e}")))?;
        if !meta.file_type().is_socket() {
            return Err(SessionError::Spawn(format!(
                "{} is not a socket",
                socket_path.display()
            )));
        }

        let manager = self.arc_self();
        let sid = session_id.clone();
        let (client, welcome) = Client::connect(&socket_path, move |event| {
            manager.handle_client_event(&sid, event, &event_sink)
        })?;

        let stderr_log_path = self.config.stderr_log_path(&session_id);
        let session = ManagedSession {
            client,
            socket_path,
            stderr_log_path,
            pid,
            start_time,
            restart_policy,
            restart_count: 0,
            reset_generation: 0,
        };
        self.sessions.lock().expect("sessions mutex poisoned").insert(session_id, session);
        Ok(welcome)
    }

    /// spec §4.4.4: remove first (disarms auto-restart), SIGTERM then
    /// SIGKILL the shellper, disconnect, unlink its files.
    #[instrument(skip(self))]
    pub fn kill_session(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.sessions.lock().expect("sessions mutex poisoned").remove(session_id);
        let Some(session) = session else {
            return Ok(());
        };

        unsafe {
            libc::kill(session.pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.term_wait_timeout_ms);
        while identity::is_alive(session.pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(self.config.term_wait_poll_ms));
        }
        if identity::is_alive(session.pid) {
            unsafe {
                libc::kill(session.pid, libc::SIGKILL);
            }
        }

        session.client.disconnect();
        let _ = fs::remove_file(&session.socket_path);
        let _ = fs::remove_file(&session.stderr_log_path);
        Ok(())
    }

    /// spec §4.4.5: unlink sockets under `sockets_dir` that no live
    /// session claims and that refuse a connection probe.
    pub fn cleanup_stale_sockets(&self) -> anyhow::Result<Vec<PathBuf>> {
        let live: HashSet<PathBuf> = self
            .sessions
            .lock()
            .expect("sessions mutex poisoned")
            .values()
            .map(|s| s.socket_path.clone())
            .collect();

        let mut removed = Vec::new();
        let entries = match fs::read_dir(&self.config.sockets_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with("shellper-") || !name.ends_with(".sock") {
                continue;
            }
            if live.contains(&path) {
                continue;
            }
            let meta = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.file_type().is_socket() {
                continue;
            }
            if probe_socket(&path, Duration::from_millis(self.config.stale_probe_timeout_ms)) {
                continue;
            }
            let _ = fs::remove_file(&path);
            removed.push(path.clone());
            let _ = fs::remove_file(path.with_extension("log"));
        }
        Ok(removed)
    }

    /// spec §4.4.6: detach Tower's end of every live shellper
    /// connection without killing the shellper processes, so a later
    /// `reconnect_session` can reattach. Timers are implicitly
    /// disarmed because `handle_client_event` stops acting once a
    /// session is gone from the map.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        for (_, session) in sessions.drain() {
            session.client.disconnect();
        }
    }

    fn handle_client_event(
        &self,
        session_id: &str,
        event: ClientEvent,
        event_sink: &(impl Fn(ClientEvent) + Send + Sync),
    ) {
        event_sink(event.clone());
        match event {
            ClientEvent::Exit(_) => self.on_pty_exit(session_id),
            ClientEvent::Close => self.on_close(session_id),
            ClientEvent::Data(_) | ClientEvent::Replay(_) | ClientEvent::Pong => {}
        }
    }

    fn on_pty_exit(&self, session_id: &str) {
        let (restart_count, policy, expected_gen, client) = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            let Some(session) = sessions.get_mut(session_id) else { return };
            session.reset_generation += 1;
            (
                session.restart_count,
                session.restart_policy.clone(),
                session.reset_generation,
                session.client.clone(),
            )
        };

        let Some(policy) = policy else {
            // No restart policy installed: the spec's auto-restart
            // wiring is conditional on `restartOnExit`, so we simply
            // leave the session registered and exited.
            return;
        };

        if restart_count >= self.config.max_restarts {
            self.sessions.lock().expect("sessions mutex poisoned").remove(session_id);
            warn!(session_id, restart_count, "restart budget exhausted, removing session");
            self.emit(
                session_id,
                SessionEvent::Removed(SessionError::MaxRestartsExhausted {
                    session_id: session_id.to_string(),
                    restart_count,
                }),
            );
            return;
        }

        {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            if let Some(session) = sessions.get_mut(session_id) {
                session.restart_count += 1;
            }
        }
        let attempt = restart_count + 1;
        self.emit(session_id, SessionEvent::Restarting { attempt });

        let delay = Duration::from_millis(self.config.restart_delay_ms);
        thread::spawn(move || {
            thread::sleep(delay);
            if client.is_disconnected() {
                return;
            }
            client.send_spawn(Spawn {
                command: policy.command,
                args: policy.args,
                cwd: policy.cwd,
                env: policy.env,
            });
        });

        self.start_reset_timer(session_id.to_string(), expected_gen);
    }

    fn start_reset_timer(&self, session_id: String, expected_gen: u64) {
        let manager = self.arc_self();
        let reset_after = Duration::from_millis(self.config.effective_restart_reset_after_ms());
        thread::spawn(move || {
            thread::sleep(reset_after);
            let mut sessions = manager.sessions.lock().expect("sessions mutex poisoned");
            if let Some(session) = sessions.get_mut(&session_id) {
                if session.reset_generation == expected_gen {
                    session.restart_count = 0;
                }
            }
        });
    }

    fn on_close(&self, session_id: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let removed = self.sessions.lock().expect("sessions mutex poisoned").remove(session_id);
        if removed.is_some() {
            self.emit(
                session_id,
                SessionEvent::Removed(SessionError::Liveness(format!(
                    "shellper socket for session {session_id} closed unexpectedly"
                ))),
            );
        }
    }
}

fn ensure_socket_dir(socket_path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let dir = socket_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("socket path has no parent directory"))?;
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_stale_socket(socket_path: &std::path::Path) -> anyhow::Result<()> {
    match fs::symlink_metadata(socket_path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(socket_path)?;
            Ok(())
        }
        Ok(_) => Err(anyhow::anyhow!(
            "refusing to overwrite non-socket file at {}",
            socket_path.display()
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn wait_for_socket(path: &std::path::Path, timeout: Duration, poll: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(meta) = fs::symlink_metadata(path) {
            if meta.file_type().is_socket() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(anyhow::anyhow!("timed out after {:?}", timeout));
        }
        thread::sleep(poll);
    }
}

fn probe_socket(path: &std::path::Path, timeout: Duration) -> bool {
    let path = path.to_path_buf();
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(UnixStream::connect(&path).is_ok());
    });
    rx.recv_timeout(timeout).unwrap_or(false)
}

fn kill_pid(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> SessionManagerConfig {
        SessionManagerConfig {
            sockets_dir: dir.to_path_buf(),
            shellper_bin: PathBuf::from("/bin/true"),
            max_restarts: 50,
            restart_delay_ms: 20,
            restart_reset_after_ms: 200,
            default_replay_buffer_lines: 10_000,
            stdout_timeout_ms: 1_000,
            socket_appear_timeout_ms: 1_000,
            socket_appear_poll_ms: 10,
            term_wait_timeout_ms: 1_000,
            term_wait_poll_ms: 10,
            stale_probe_timeout_ms: 200,
        }
    }

    #[test]
    fn reconnect_rejects_dead_pid() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});
        // pid 1 belongs to init and is (almost) certainly not a
        // process we spawned; use a pid we know is dead instead: fork
        // and immediately reap a short-lived child is overkill for a
        // unit test, so we rely on a pid far outside any plausible
        // live range combined with is_alive's kill(pid, 0) check.
        let err = manager
            .reconnect_session(
                "s1".into(),
                dir.path().join("shellper-s1.sock"),
                libc::pid_t::MAX - 1,
                0,
                None,
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
    }

    #[test]
    fn reconnect_rejects_pid_reuse() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});
        let pid = std::process::id() as libc::pid_t;
        let observed = identity::get_process_start_time(pid);
        let recorded = observed.unwrap_or(0) + 10_000_000;
        let err = manager
            .reconnect_session(
                "s1".into(),
                dir.path().join("shellper-s1.sock"),
                pid,
                recorded,
                None,
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::PidReuse { .. }));
    }

    #[test]
    fn reconnect_rejects_non_socket_path() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});
        let pid = std::process::id() as libc::pid_t;
        let observed = identity::get_process_start_time(pid).unwrap_or(0);
        let regular_file = dir.path().join("shellper-s1.sock");
        fs::write(&regular_file, b"not a socket").unwrap();
        let err = manager
            .reconnect_session("s1".into(), regular_file, pid, observed, None, |_| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
    }

    #[test]
    fn cleanup_removes_sockets_that_refuse_connection() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});

        // A listening socket: the probe should accept and leave it.
        let live_path = dir.path().join("shellper-live.sock");
        let _listener = UnixListener::bind(&live_path).unwrap();

        // A stale socket path: nothing is listening there.
        let stale_path = dir.path().join("shellper-stale.sock");
        {
            let l = UnixListener::bind(&stale_path).unwrap();
            drop(l);
        }
        fs::remove_file(&stale_path).ok();
        // Recreate as an unlinked-listener scenario isn't easy to
        // fabricate portably; instead bind then immediately drop
        // without removing, which leaves a socket file nothing
        // listens on.
        {
            let l = UnixListener::bind(&stale_path).unwrap();
            drop(l);
        }

        let removed = manager.cleanup_stale_sockets().unwrap();
        assert!(removed.contains(&stale_path));
        assert!(live_path.exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});
        let stale_path = dir.path().join("shellper-gone.sock");
        {
            let l = UnixListener::bind(&stale_path).unwrap();
            drop(l);
        }
        let first = manager.cleanup_stale_sockets().unwrap();
        assert_eq!(first.len(), 1);
        let second = manager.cleanup_stale_sockets().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn shutdown_clears_the_session_map() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});
        assert!(manager.session_ids().is_empty());
        manager.shutdown();
        assert!(manager.session_ids().is_empty());
    }

    #[test]
    fn kill_session_on_unknown_id_is_a_noop() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()), |_, _| {});
        assert!(manager.kill_session("nope").is_ok());
    }

    #[test]
    fn events_are_observable_through_the_callback() {
        let dir = tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let manager = SessionManager::new(test_config(dir.path()), move |id, event| {
            let _ = tx.send((id, format!("{event:?}")));
        });
        manager.emit("s1", SessionEvent::Error(SessionError::Liveness("boom".into())));
        let (id, msg) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(id, "s1");
        assert!(msg.contains("Liveness"));
    }
}
