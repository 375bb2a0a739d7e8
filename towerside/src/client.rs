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

//! The Tower-side shellper client: handshake, post-handshake frame
//! dispatch, and safe (no-op-when-disconnected) writes (spec §4.5).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use shellper_protocol::{
    ClientType, Exit, Frame, FrameParser, Hello, Resize, Signal, Spawn, Welcome, PROTOCOL_VERSION,
};
use tracing::warn;

use crate::errors::SessionError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_REPLAY_WAIT: Duration = Duration::from_millis(500);

/// Events the dispatch loop hands back to the session wrapper that
/// owns this client, per spec §4.5 ("emits one of: data, exit, replay,
/// pong"). The wrapper subscribes to the client, never the reverse,
/// to avoid the owning cycle spec §9 warns about.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Data(Vec<u8>),
    Exit(Exit),
    Replay(Vec<u8>),
    Pong,
    /// The socket closed after a successful handshake. Not an error.
    Close,
}

pub struct Client {
    writer: Mutex<UnixStream>,
    replay_rx: Receiver<Vec<u8>>,
    disconnected: Arc<AtomicBool>,
}

impl Client {
    /// Connect, perform the HELLO/WELCOME handshake, and start the
    /// dispatch loop. `on_event` is only ever invoked from the
    /// dispatch thread spawned here.
    pub fn connect<P, F>(path: P, on_event: F) -> Result<(Arc<Client>, Welcome), SessionError>
    where
        P: AsRef<Path>,
        F: Fn(ClientEvent) + Send + 'static,
    {
        let mut stream = UnixStream::connect(path.as_ref())
            .map_err(|e| SessionError::Handshake(format!("connecting: {e}")))?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(|e| SessionError::Handshake(format!("setting handshake timeout: {e}")))?;

        let hello = Frame::Hello(Hello { version: PROTOCOL_VERSION, client_type: ClientType::Tower });
        hello
            .encode(&mut stream)
            .map_err(|e| SessionError::Handshake(format!("writing HELLO: {e}")))?;

        let mut parser = FrameParser::new();
        let mut buf = [0u8; 4096];
        let mut buffered = Vec::new();
        let welcome = loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| SessionError::Handshake(format!("waiting for WELCOME: {e}")))?;
            if n == 0 {
                return Err(SessionError::Handshake("socket closed during handshake".into()));
            }
            parser.feed(&buf[..n]);
            let mut found = None;
            while let Some(frame) = parser
                .next_frame()
                .map_err(|e| SessionError::Handshake(format!("parsing handshake frame: {e}")))?
            {
                match frame {
                    Frame::Welcome(w) => {
                        found = Some(w);
                        break;
                    }
                    other => buffered.push(other),
                }
            }
            if let Some(w) = found {
                break w;
            }
        };

        if welcome.version < PROTOCOL_VERSION {
            return Err(SessionError::Handshake(format!(
                "stale shellper: version {} < ours {}",
                welcome.version, PROTOCOL_VERSION
            )));
        } else if welcome.version > PROTOCOL_VERSION {
            warn!(
                shellper_version = welcome.version,
                our_version = PROTOCOL_VERSION,
                "shellper is newer than Tower, continuing (forward compatible)"
            );
        }

        stream
            .set_read_timeout(None)
            .map_err(|e| SessionError::Handshake(format!("clearing handshake timeout: {e}")))?;

        let (replay_tx, replay_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = bounded(1);
        let disconnected = Arc::new(AtomicBool::new(false));

        let reader_stream = stream.try_clone().map_err(|e| {
            SessionError::Handshake(format!("cloning stream for dispatch thread: {e}"))
        })?;

        let client = Arc::new(Client {
            writer: Mutex::new(stream),
            replay_rx,
            disconnected: disconnected.clone(),
        });

        spawn_dispatch_loop(reader_stream, parser, buffered, replay_tx, disconnected, on_event);

        Ok((client, welcome))
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Waits (with a bounded timeout) for the first `REPLAY` frame.
    /// Returns an empty byte sequence if none arrives -- the shellper
    /// had nothing to replay (spec §4.5).
    pub fn wait_for_replay(&self, timeout: Option<Duration>) -> Vec<u8> {
        let timeout = timeout.unwrap_or(DEFAULT_REPLAY_WAIT);
        self.replay_rx.recv_timeout(timeout).unwrap_or_default()
    }

    pub fn send_data(&self, buf: &[u8]) {
        self.send(Frame::Data(buf.to_vec()));
    }

    pub fn send_resize(&self, cols: u16, rows: u16) {
        self.send(Frame::Resize(Resize { cols, rows }));
    }

    pub fn send_signal(&self, signal: u32) {
        self.send(Frame::Signal(Signal { signal }));
    }

    pub fn send_spawn(&self, spawn: Spawn) {
        self.send(Frame::Spawn(spawn));
    }

    pub fn send_ping(&self) {
        self.send(Frame::Ping);
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        if let Ok(stream) = self.writer.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn send(&self, frame: Frame) {
        if self.is_disconnected() {
            return;
        }
        let mut stream = self.writer.lock().expect("writer mutex poisoned");
        if let Err(e) = frame.encode(&mut *stream) {
            warn!("writing frame to shellper: {e}");
        }
    }
}

fn spawn_dispatch_loop<F>(
    mut stream: UnixStream,
    mut parser: FrameParser,
    buffered: Vec<Frame>,
    replay_tx: Sender<Vec<u8>>,
    disconnected: Arc<AtomicBool>,
    on_event: F,
) where
    F: Fn(ClientEvent) + Send + 'static,
{
    thread::spawn(move || {
        for frame in buffered {
            dispatch_one(frame, &replay_tx, &on_event);
        }

        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            parser.feed(&buf[..n]);
            loop {
                match parser.next_frame() {
                    Ok(Some(frame)) => dispatch_one(frame, &replay_tx, &on_event),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("protocol error from shellper: {e}");
                        disconnected.store(true, Ordering::SeqCst);
                        on_event(ClientEvent::Close);
                        return;
                    }
                }
            }
        }

        disconnected.store(true, Ordering::SeqCst);
        on_event(ClientEvent::Close);
    });
}

fn dispatch_one<F: Fn(ClientEvent)>(frame: Frame, replay_tx: &Sender<Vec<u8>>, on_event: &F) {
    match frame {
        Frame::Data(b) => on_event(ClientEvent::Data(b)),
        Frame::Exit(e) => on_event(ClientEvent::Exit(e)),
        Frame::Replay(b) => {
            let _ = replay_tx.try_send(b.clone());
            on_event(ClientEvent::Replay(b));
        }
        Frame::Pong => on_event(ClientEvent::Pong),
        // Duplicate WELCOME, or a shellper-bound type reflected back:
        // ignored per spec §4.5.
        Frame::Welcome(_) | Frame::Hello(_) | Frame::Resize(_) | Frame::Signal(_) | Frame::Spawn(_) => {}
        Frame::Ping => {}
        Frame::Unknown(_, _) => {}
    }
}
