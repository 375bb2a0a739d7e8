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

//! End-to-end Session Manager scenarios against a real `shellper`
//! binary, mirroring spec §8's testable properties S1-S3.

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use assert_matches::assert_matches;
use ntest::timeout;
use tempfile::tempdir;
use towerside::config::SessionManagerConfig;
use towerside::errors::SessionError;
use towerside::session_manager::{CreateSessionOptions, SessionEvent, SessionManager};

fn shellper_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_shellper"))
}

fn test_config(dir: &std::path::Path) -> SessionManagerConfig {
    SessionManagerConfig {
        sockets_dir: dir.to_path_buf(),
        shellper_bin: shellper_bin(),
        max_restarts: 50,
        restart_delay_ms: 50,
        restart_reset_after_ms: 200,
        default_replay_buffer_lines: 1000,
        stdout_timeout_ms: 5_000,
        socket_appear_timeout_ms: 5_000,
        socket_appear_poll_ms: 20,
        term_wait_timeout_ms: 2_000,
        term_wait_poll_ms: 20,
        stale_probe_timeout_ms: 1_000,
    }
}

fn cat_options(session_id: &str) -> CreateSessionOptions {
    CreateSessionOptions {
        session_id: session_id.to_string(),
        command: "/bin/cat".to_string(),
        args: vec![],
        cwd: None,
        env: vec![],
        cols: 80,
        rows: 24,
        restart_on_exit: false,
        replay_buffer_lines: None,
    }
}

/// S1: a session created by one Session Manager instance can be
/// reattached by a fresh instance (standing in for a Tower restart),
/// and the shellper process itself is never killed in between.
#[test]
#[timeout(15000)]
fn reconnect_survives_a_simulated_tower_restart() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let manager_before = SessionManager::new(config.clone(), |_, _| {});
    let welcome = manager_before.create_session(cat_options("s1"), |_| {}).expect("create_session");
    let pid = welcome.pid;
    let start_time = welcome.start_time;

    // Graceful Tower exit: disconnect without killing the shellper.
    manager_before.shutdown();
    drop(manager_before);

    let manager_after = SessionManager::new(config.clone(), |_, _| {});
    let socket_path = config.socket_path("s1");
    let welcome2 = manager_after
        .reconnect_session("s1".to_string(), socket_path, pid, start_time, None, |_| {})
        .expect("reconnect_session");

    assert_eq!(welcome2.pid, pid);
    assert_eq!(welcome2.start_time, start_time);

    manager_after.kill_session("s1").expect("cleanup");
}

/// S2: a reconnect attempt whose recorded start time no longer matches
/// the live process (pid reuse, or just a stale record) is rejected
/// rather than silently trusted.
#[test]
#[timeout(15000)]
fn reconnect_rejects_a_stale_start_time() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let manager = SessionManager::new(config.clone(), |_, _| {});
    let welcome = manager.create_session(cat_options("s1"), |_| {}).expect("create_session");
    let pid = welcome.pid;
    manager.shutdown();
    drop(manager);

    let manager_after = SessionManager::new(config.clone(), |_, _| {});
    let socket_path = config.socket_path("s1");
    let bogus_start_time = welcome.start_time + 10_000_000;
    let err = manager_after
        .reconnect_session("s1".to_string(), socket_path, pid, bogus_start_time, None, |_| {})
        .unwrap_err();
    assert_matches!(err, SessionError::PidReuse { .. });

    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// S3: a PTY that exits with an installed restart policy is respawned
/// automatically, and the Session Manager reports the attempt.
#[test]
#[timeout(15000)]
fn exited_pty_with_restart_policy_is_respawned() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let (tx, rx) = mpsc::channel();
    let manager = SessionManager::new(config, move |id, event| {
        let _ = tx.send((id, event));
    });

    let mut opts = cat_options("s1");
    opts.command = "/bin/sh".to_string();
    opts.args = vec!["-c".to_string(), "exit 0".to_string()];
    opts.restart_on_exit = true;

    manager.create_session(opts, |_| {}).expect("create_session");

    let (id, event) = rx.recv_timeout(Duration::from_secs(10)).expect("restart event");
    assert_eq!(id, "s1");
    assert_matches!(event, SessionEvent::Restarting { .. });

    let _ = manager.kill_session("s1");
}
