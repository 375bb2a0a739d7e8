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

// tooling gets confused by the conditional compilation
#![allow(dead_code)]

//! An auxiliary Unix socket, only bound when the `test_hooks` feature
//! is on, that lets an integration test harness watch internal events
//! and poll connection/ring state without a real protocol handshake.
//! Named events are pushed as newline-delimited tags to every dialed-in
//! client, same shape as the teacher's `daemon::test_hooks`.

use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Mutex;
use std::time;

use anyhow::{anyhow, Context};
use tracing::{error, info};

#[cfg(feature = "test_hooks")]
pub fn emit(event: &str) {
    let sock_path = TEST_HOOK_SERVER.sock_path.lock().unwrap();
    if sock_path.is_some() {
        TEST_HOOK_SERVER.emit_event(event);
    }
}

#[cfg(not(feature = "test_hooks"))]
pub fn emit(_event: &str) {
    // a no-op in production builds
}

/// Pushes a `status connections=<n> ring_lines=<m>` line so a test
/// harness can assert on fan-out/eviction state without sleeping.
#[cfg(feature = "test_hooks")]
pub fn emit_status(connections: usize, ring_lines: usize) {
    emit(&format!("status connections={connections} ring_lines={ring_lines}"));
}

#[cfg(not(feature = "test_hooks"))]
pub fn emit_status(_connections: usize, _ring_lines: usize) {}

lazy_static::lazy_static! {
    pub static ref TEST_HOOK_SERVER: TestHookServer = TestHookServer::new();
}

pub struct TestHookServer {
    sock_path: Mutex<Option<String>>,
    clients: Mutex<Vec<UnixStream>>,
}

impl TestHookServer {
    fn new() -> Self {
        TestHookServer { sock_path: Mutex::new(None), clients: Mutex::new(vec![]) }
    }

    pub fn set_socket_path(&self, path: String) {
        let mut sock_path = self.sock_path.lock().unwrap();
        *sock_path = Some(path);
    }

    pub fn wait_for_connect(&self) -> anyhow::Result<()> {
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            {
                let clients = self.clients.lock().unwrap();
                if !clients.is_empty() {
                    return Ok(());
                }
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
        Err(anyhow!("no connection to test hook server"))
    }

    /// Background thread: accept dial-ins and remember each one so
    /// `emit_event` can broadcast to all of them. The caller spawns
    /// the worker thread.
    pub fn start(&self) {
        let sock_path = {
            let guard = self.sock_path.lock().unwrap();
            match &*guard {
                Some(s) => s.clone(),
                None => {
                    error!("you must call set_socket_path before calling start");
                    return;
                }
            }
        };

        let listener = match UnixListener::bind(&sock_path).context("binding to test hook socket") {
            Ok(l) => l,
            Err(e) => {
                error!("error binding to test hook socket: {:?}", e);
                return;
            }
        };
        info!(sock_path, "listening for test hook connections");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    error!("error accepting test hook connection: {:?}", e);
                    continue;
                }
            };
            info!("accepted new test hook client");
            self.clients.lock().unwrap().push(stream);
        }
    }

    fn emit_event(&self, event: &str) {
        info!(event, "emitting test hook event");
        let line = format!("{event}\n");
        let clients = self.clients.lock().unwrap();
        for mut client in clients.iter() {
            if let Err(e) = client.write_all(line.as_bytes()) {
                error!("error emitting '{}' event: {:?}", event, e);
            }
        }
    }
}
