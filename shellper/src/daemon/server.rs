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

//! Per-connection state machine: `PendingHello -> Active -> Closed`.
//! Every accepted connection gets a reader thread (parses inbound
//! frames, dispatches commands) and a writer thread (drains the
//! connection's outbound mailbox onto the socket). The two only share
//! the [`ShellperSession`] and the mailbox channel -- no connection-level
//! locking is needed.

use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use shellper_protocol::{ClientType, Frame, FrameParser};
use tracing::{info, instrument, warn};

use crate::daemon::session::{spawn_spec_from, ShellperSession};
use crate::errors::DaemonError;
use crate::pty::TtySize;

const OUTBOUND_MAILBOX_CAPACITY: usize = 1024;
const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(PartialEq, Eq)]
enum ConnState {
    PendingHello,
    Active,
    Closed,
}

/// Accept loop entry point: spawns the reader/writer thread pair for
/// one freshly-accepted socket.
pub fn spawn_connection(session: Arc<ShellperSession>, stream: UnixStream) {
    thread::spawn(move || {
        if let Err(e) = run_connection(session, stream) {
            warn!("connection handler exited with error: {e:#}");
        }
    });
}

#[instrument(skip_all)]
fn run_connection(session: Arc<ShellperSession>, stream: UnixStream) -> anyhow::Result<()> {
    let writer_stream = stream.try_clone()?;
    let (tx, rx) = bounded::<Frame>(OUTBOUND_MAILBOX_CAPACITY);
    let writer_handle = thread::spawn(move || run_writer(writer_stream, rx));

    let result = run_reader(session, stream.try_clone()?, tx);

    let _ = stream.shutdown(Shutdown::Both);
    let _ = writer_handle.join();
    result
}

fn run_writer(mut stream: UnixStream, rx: Receiver<Frame>) {
    for frame in rx {
        if let Err(e) = frame.encode(&mut stream) {
            warn!("writing frame to client: {e}");
            return;
        }
        if stream.flush().is_err() {
            return;
        }
    }
}

fn run_reader(
    session: Arc<ShellperSession>,
    mut stream: UnixStream,
    tx: crossbeam_channel::Sender<Frame>,
) -> anyhow::Result<()> {
    let mut parser = FrameParser::new();
    let mut state = ConnState::PendingHello;
    let mut conn_id: Option<u64> = None;
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if state == ConnState::Closed {
            break;
        }

        let n = match std::io::Read::read(&mut stream, &mut buf) {
            Ok(0) => break, // client closed the socket
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        parser.feed(&buf[..n]);

        loop {
            let frame = match parser.next_frame() {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    let e: DaemonError = e.into();
                    warn!("{e}, destroying connection");
                    state = ConnState::Closed;
                    break;
                }
            };

            match state {
                ConnState::PendingHello => {
                    if let Frame::Hello(hello) = frame {
                        let id = session.register_connection(hello.client_type, tx.clone());
                        conn_id = Some(id);
                        let _ = tx.send(Frame::Welcome(session.welcome()));
                        if let Some(replay) = session.replay_frame() {
                            let _ = tx.send(replay);
                        }
                        state = ConnState::Active;
                        info!(connection_id = id, client_type = ?hello.client_type, "handshake complete");
                    }
                    // any other frame type pre-handshake is discarded, not an error
                }
                ConnState::Active => {
                    let id = conn_id.expect("active state implies registered");
                    if !dispatch_active_frame(&session, id, frame) {
                        state = ConnState::Closed;
                    }
                }
                ConnState::Closed => break,
            }
        }
    }

    if let Some(id) = conn_id {
        session.remove_connection(id);
    }
    Ok(())
}

/// Returns `false` if the connection should be destroyed (malformed
/// command payload for something we can only half-validate at the
/// frame layer).
fn dispatch_active_frame(session: &Arc<ShellperSession>, conn_id: u64, frame: Frame) -> bool {
    let client_type = session.connection_client_type(conn_id);
    match frame {
        Frame::Data(payload) => {
            session.write_data(&payload);
            true
        }
        Frame::Resize(resize) => {
            session.resize(resize.cols, resize.rows);
            true
        }
        Frame::Signal(sig) => {
            if client_type != Some(ClientType::Tower) {
                // silently ignored from terminal clients
                return true;
            }
            if !session.signal(sig.signal) {
                warn!(signal = sig.signal, "protocol error: disallowed signal number");
            }
            true
        }
        Frame::Spawn(spawn) => {
            if client_type != Some(ClientType::Tower) {
                return true;
            }
            let size = session.size();
            let spec = spawn_spec_from(
                spawn.command,
                spawn.args,
                spawn.cwd,
                spawn.env,
                TtySize { cols: size.cols, rows: size.rows },
            );
            if let Err(e) = session.respawn(spec) {
                warn!("respawn failed: {e:#}");
            }
            true
        }
        Frame::Ping => {
            session.send_to(conn_id, Frame::Pong);
            true
        }
        Frame::Pong => true,
        Frame::Hello(_) | Frame::Welcome(_) | Frame::Exit(_) | Frame::Replay(_) => {
            // shellper-bound frame types received from a client are ignored
            true
        }
        Frame::Unknown(_, _) => true,
    }
}
