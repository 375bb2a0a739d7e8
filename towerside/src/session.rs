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

//! The session wrapper (spec §4.6): owns a Line Ring, a disk
//! transcript, the set of attached UI clients, and either a shellper
//! client or a directly-owned PTY. Fans shellper/PTY output out to UI
//! clients and serves resume-by-sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::info;

use crate::client::Client;
use crate::disk_log::DiskLog;
use crate::line_ring::{LineRing, SeqLine};
use crate::ws_protocol::{ControlMessage, WsFrame};

/// Push a `seq` advertisement after every attach, and again whenever
/// this many lines have been committed since the last one (spec §9
/// open question: cadence is reactive to traffic, not a fixed timer).
const SEQ_ADVERTISE_EVERY_LINES: u64 = 64;

/// Default UI-detach grace period for directly-owned (non-shellper)
/// sessions before the PTY is killed (spec §4.6.3).
pub const DEFAULT_DETACH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub enum Backend {
    /// The common case: a shellper daemon keeps the PTY alive
    /// independently of UI presence.
    ShellperBacked(Arc<Client>),
    /// A PTY owned directly by Tower, with no shellper in between.
    /// UI detach starts a kill timer for these.
    Owned,
}

struct UiClient {
    sender: Sender<WsFrame>,
}

pub struct SessionWrapper {
    id: String,
    backend: Backend,
    line_ring: Mutex<LineRing>,
    partial_line: Mutex<Vec<u8>>,
    lines_since_seq_advert: AtomicU64,
    disk_log: Mutex<DiskLog>,
    ui_clients: Mutex<HashMap<u64, UiClient>>,
    next_ui_id: AtomicU64,
    detach_deadline: Mutex<Option<Instant>>,
    detach_timeout: Duration,
    shutting_down: AtomicBool,
    /// Lets `&self` methods hand a background thread an owning
    /// `Arc<Self>` without requiring callers to juggle the Arc
    /// themselves (stable Rust has no `self: &Arc<Self>` receiver).
    self_weak: Weak<SessionWrapper>,
}

impl SessionWrapper {
    pub fn new(
        id: String,
        backend: Backend,
        disk_log: DiskLog,
        line_ring_capacity: usize,
        detach_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| SessionWrapper {
            id,
            backend,
            line_ring: Mutex::new(LineRing::new(line_ring_capacity)),
            partial_line: Mutex::new(Vec::new()),
            lines_since_seq_advert: AtomicU64::new(0),
            disk_log: Mutex::new(disk_log),
            ui_clients: Mutex::new(HashMap::new()),
            next_ui_id: AtomicU64::new(1),
            detach_deadline: Mutex::new(None),
            detach_timeout,
            shutting_down: AtomicBool::new(false),
            self_weak: weak_self.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// §4.6.1 data path: append to the disk log, broadcast raw bytes
    /// to every UI client, and commit whole lines into the Line Ring.
    pub fn on_data(&self, raw: &[u8]) {
        if let Err(e) = self.disk_log.lock().expect("disk log mutex poisoned").append(raw) {
            tracing::warn!("appending to disk log: {e}");
        }
        self.broadcast(WsFrame::Data(raw.to_vec()));
        self.commit_lines(raw);
    }

    fn commit_lines(&self, raw: &[u8]) {
        let mut partial = self.partial_line.lock().expect("partial line mutex poisoned");
        partial.extend_from_slice(raw);
        let mut committed = 0u64;
        loop {
            let newline_at = partial.iter().position(|&b| b == b'\n');
            let Some(pos) = newline_at else { break };
            let line_bytes: Vec<u8> = partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes).trim_end_matches('\n').to_string();
            self.line_ring.lock().expect("line ring mutex poisoned").push(line);
            committed += 1;
        }
        drop(partial);

        if committed > 0 {
            let total = self.lines_since_seq_advert.fetch_add(committed, Ordering::SeqCst) + committed;
            if total >= SEQ_ADVERTISE_EVERY_LINES {
                self.lines_since_seq_advert.store(0, Ordering::SeqCst);
                self.advertise_seq();
            }
        }
    }

    fn advertise_seq(&self) {
        let seq = self.line_ring.lock().expect("line ring mutex poisoned").highest_seq();
        self.broadcast(WsFrame::Control(ControlMessage::Seq { seq }));
    }

    /// Register a new UI client and return its id plus a full replay
    /// of the Line Ring (spec §4.6.2).
    pub fn attach(&self, sender: Sender<WsFrame>) -> (u64, Vec<SeqLine>) {
        let id = self.next_ui_id.fetch_add(1, Ordering::SeqCst);
        self.ui_clients.lock().expect("ui clients mutex poisoned").insert(id, UiClient { sender });
        self.cancel_detach_timer();
        let replay = self.line_ring.lock().expect("line ring mutex poisoned").all();
        self.advertise_seq();
        (id, replay)
    }

    /// Resume attach: returns only lines newer than `since_seq`,
    /// clamped to the oldest surviving line (spec §4.6.2).
    pub fn attach_resume(&self, sender: Sender<WsFrame>, since_seq: u64) -> (u64, Vec<SeqLine>) {
        let id = self.next_ui_id.fetch_add(1, Ordering::SeqCst);
        self.ui_clients.lock().expect("ui clients mutex poisoned").insert(id, UiClient { sender });
        self.cancel_detach_timer();
        let resumed = self.line_ring.lock().expect("line ring mutex poisoned").get_since(since_seq);
        self.advertise_seq();
        (id, resumed)
    }

    /// §4.6.3: shellper-backed sessions outlive UI presence. Directly
    /// owned ones start a kill timer once the last UI client leaves.
    pub fn detach(&self, ui_id: u64, on_timeout: impl Fn() + Send + 'static) {
        let now_empty = {
            let mut clients = self.ui_clients.lock().expect("ui clients mutex poisoned");
            clients.remove(&ui_id);
            clients.is_empty()
        };
        if !now_empty {
            return;
        }
        match &self.backend {
            Backend::ShellperBacked(_) => {}
            Backend::Owned => self.start_detach_timer(on_timeout),
        }
    }

    fn start_detach_timer(&self, on_timeout: impl Fn() + Send + 'static) {
        let deadline = Instant::now() + self.detach_timeout;
        *self.detach_deadline.lock().expect("detach deadline mutex poisoned") = Some(deadline);
        let session = self.self_weak.upgrade().expect("session outlives its own method call");
        thread::spawn(move || {
            loop {
                thread::sleep(Duration::from_millis(250));
                let still_armed = {
                    let guard = session.detach_deadline.lock().expect("detach deadline mutex poisoned");
                    matches!(*guard, Some(d) if d == deadline)
                };
                if !still_armed {
                    return; // a new attach cancelled or superseded this timer
                }
                if Instant::now() >= deadline {
                    *session.detach_deadline.lock().expect("detach deadline mutex poisoned") = None;
                    info!(session_id = %session.id, "ui detach timeout expired, killing owned pty");
                    on_timeout();
                    return;
                }
            }
        });
    }

    fn cancel_detach_timer(&self) {
        *self.detach_deadline.lock().expect("detach deadline mutex poisoned") = None;
    }

    /// §4.6.5: on intentional Tower shutdown, detach from the
    /// shellper client instead of letting its `close`/`exit` cascade
    /// into session-record deletion. Shellper-backed sessions must
    /// survive a Tower restart.
    pub fn shutdown_detach(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Backend::ShellperBacked(client) = &self.backend {
            client.disconnect();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Broadcast a frame to every UI client; drop one on write failure
    /// (spec §4.6.1).
    fn broadcast(&self, frame: WsFrame) {
        let mut clients = self.ui_clients.lock().expect("ui clients mutex poisoned");
        clients.retain(|_, c| c.sender.try_send(frame.clone()).is_ok());
    }
}
