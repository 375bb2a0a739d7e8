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

use clap::Parser;
use shellper::{config, daemon};
use tracing_subscriber::fmt::format::FmtSpan;

/// shellper owns a single PTY and serves it to multiple clients over a
/// Unix socket. It is spawned by a Session Manager, never by hand.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config: {command, args, cwd, env, cols, rows, socketPath, replayBufferLines?}
    config: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let args = Args::parse();

    let config = match config::ShellperConfig::from_json(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("shellper: bad config: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon::run(config) {
        eprintln!("shellper: fatal error: {e:#}");
        std::process::exit(1);
    }
}
