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

//! Daemon entrypoint: the startup sequence in spec §4.3.1 plus the
//! accept loop that hands each connection off to [`server`].

pub mod server;
pub mod session;
pub mod signals;

use std::fs;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde_derive::Serialize;
use tracing::info;

use crate::config::ShellperConfig;
use crate::consts::{SOCKET_DIR_MODE, SOCKET_FILE_MODE};
use crate::pty::{SpawnSpec, TtySize};
use crate::test_hooks;
use session::ShellperSession;

#[derive(Serialize)]
struct StartupInfo {
    pid: i32,
    #[serde(rename = "startTime")]
    start_time: i64,
}

pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn run(config: ShellperConfig) -> anyhow::Result<()> {
    let socket_path = PathBuf::from(&config.socket_path);
    ensure_socket_dir(&socket_path)?;
    remove_stale_socket(&socket_path)?;

    let spec = SpawnSpec {
        command: config.command.clone(),
        args: config.args.clone(),
        cwd: config.cwd.clone(),
        env: config.env.clone(),
        size: TtySize { cols: config.cols, rows: config.rows },
    };
    let start_time = epoch_ms();
    let session = ShellperSession::spawn(spec, config.replay_buffer_lines, start_time)
        .context("spawning initial pty")?;

    emit_startup_line(session.pid(), start_time)?;

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding socket {}", socket_path.display()))?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(SOCKET_FILE_MODE))
        .context("chmod-ing socket")?;

    signals::Handler::new(socket_path.clone()).spawn().context("installing signal handler")?;

    start_test_hooks(&socket_path);

    info!(socket = %socket_path.display(), pid = session.pid(), "shellper listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => server::spawn_connection(session.clone(), stream),
            Err(e) => {
                tracing::warn!("accept error: {e}");
            }
        }
    }

    Ok(())
}

fn ensure_socket_dir(socket_path: &Path) -> anyhow::Result<()> {
    let dir = socket_path.parent().ok_or_else(|| anyhow!("socket path has no parent dir"))?;
    fs::create_dir_all(dir).with_context(|| format!("creating socket dir {}", dir.display()))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(SOCKET_DIR_MODE))
        .with_context(|| format!("chmod-ing socket dir {}", dir.display()))?;
    Ok(())
}

fn remove_stale_socket(socket_path: &Path) -> anyhow::Result<()> {
    match fs::symlink_metadata(socket_path) {
        Ok(meta) => {
            if meta.file_type().is_socket() {
                fs::remove_file(socket_path)
                    .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
            } else {
                return Err(anyhow!(
                    "refusing to overwrite non-socket file at {}",
                    socket_path.display()
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("statting socket path"),
    }
    Ok(())
}

fn emit_startup_line(pid: libc::pid_t, start_time: i64) -> anyhow::Result<()> {
    let info = StartupInfo { pid, start_time };
    let line = serde_json::to_string(&info).context("encoding startup line")?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{line}").context("writing startup line")?;
    handle.flush().context("flushing startup line")?;
    drop(handle);
    // Closing stdout signals the Session Manager that no more output
    // is coming on this stream (spec §4.3.1 step 4).
    drop_stdout();
    Ok(())
}

#[cfg(feature = "test_hooks")]
fn start_test_hooks(socket_path: &Path) {
    let hook_path = format!("{}.testhooks", socket_path.display());
    test_hooks::TEST_HOOK_SERVER.set_socket_path(hook_path);
    std::thread::spawn(|| test_hooks::TEST_HOOK_SERVER.start());
}

#[cfg(not(feature = "test_hooks"))]
fn start_test_hooks(_socket_path: &Path) {}

fn drop_stdout() {
    use std::os::unix::io::AsRawFd;
    let fd = std::io::stdout().as_raw_fd();
    unsafe {
        libc::close(fd);
    }
}
