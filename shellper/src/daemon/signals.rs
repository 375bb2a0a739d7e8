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

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{error, info};

/// Installs a handler that performs graceful shutdown on SIGTERM
/// (spec §4.3.1 step 6): unlink the socket and exit 0. A second
/// term signal forces an immediate exit, same as the teacher's
/// double-registration idiom.
pub struct Handler {
    sock: PathBuf,
}

impl Handler {
    pub fn new(sock: PathBuf) -> Self {
        Handler { sock }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));

                info!("term signal received, cleaning up socket");
                if let Err(e) = std::fs::remove_file(&self.sock) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!("error cleaning up socket file: {e}");
                    }
                }

                info!("exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
