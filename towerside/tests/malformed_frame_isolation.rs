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

//! S5: one connection sending a malformed frame only tears down that
//! connection -- a sibling connection on the same shellper keeps
//! working (spec §4.3.3, §8). Talks to a real `shellper` binary over
//! raw sockets rather than through `Client`, since `Client` can only
//! ever encode well-formed frames.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, WriteBytesExt};
use ntest::timeout;
use serde_json::json;
use shellper_protocol::{ClientType, Frame, FrameParser, Hello, PROTOCOL_VERSION};
use tempfile::tempdir;

fn shellper_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_shellper"))
}

fn wait_for_socket(path: &std::path::Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        assert!(Instant::now() < deadline, "socket never appeared at {}", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn handshake(stream: &mut UnixStream) {
    let hello = Frame::Hello(Hello { version: PROTOCOL_VERSION, client_type: ClientType::Terminal });
    hello.encode(stream).expect("writing HELLO");

    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).expect("reading WELCOME");
        assert_ne!(n, 0, "socket closed during handshake");
        parser.feed(&buf[..n]);
        while let Some(frame) = parser.next_frame().expect("parsing handshake frame") {
            if let Frame::Welcome(_) = frame {
                return;
            }
        }
    }
}

fn ping_pong_roundtrips(stream: &mut UnixStream) -> bool {
    if Frame::Ping.encode(stream).is_err() {
        return false;
    }
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("setting read timeout");
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };
        parser.feed(&buf[..n]);
        match parser.next_frame() {
            Ok(Some(Frame::Pong)) => return true,
            Ok(Some(_)) => continue,
            Ok(None) => continue,
            Err(_) => return false,
        }
    }
}

#[test]
#[timeout(15000)]
fn malformed_resize_closes_only_the_offending_connection() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("shellper-s1.sock");

    let config = json!({
        "command": "/bin/cat",
        "args": [],
        "cols": 80,
        "rows": 24,
        "socketPath": socket_path.to_string_lossy(),
    })
    .to_string();

    let mut child = Command::new(shellper_bin())
        .arg(&config)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawning shellper");

    wait_for_socket(&socket_path, Duration::from_secs(5));

    let mut good = UnixStream::connect(&socket_path).expect("connecting good client");
    handshake(&mut good);

    let mut bad = UnixStream::connect(&socket_path).expect("connecting bad client");
    handshake(&mut bad);

    // A RESIZE frame (tag 0x02) whose payload isn't valid JSON: the
    // frame layer accepts the length-prefixed bytes, dispatch fails to
    // parse the payload, and the connection is torn down.
    let garbage: &[u8] = b"not json";
    bad.write_u8(0x02).expect("writing tag");
    bad.write_u32::<BigEndian>(garbage.len() as u32).expect("writing length");
    bad.write_all(garbage).expect("writing payload");
    bad.flush().unwrap();

    let mut discard = [0u8; 64];
    bad.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let n = bad.read(&mut discard).unwrap_or(0);
    assert_eq!(n, 0, "malformed connection should be closed by the server");

    assert!(
        ping_pong_roundtrips(&mut good),
        "a sibling connection must survive another connection's protocol error"
    );

    let _ = child.kill();
    let _ = child.wait();
}
