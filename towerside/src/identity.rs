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

//! Process identity: the `(pid, startTime)` tuple used instead of a
//! bare pid to defeat PID reuse at reconnect (spec §4.4.7, §4.4.2).

/// How close two start times need to be to count as "the same
/// process" at reconnect.
pub const START_TIME_TOLERANCE_MS: i64 = 2_000;

pub fn is_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Returns the process's start time in epoch milliseconds, or `None`
/// if it cannot be determined on this platform (in which case the
/// caller must treat reconnect as a mismatch, per spec §4.4.7).
pub fn get_process_start_time(pid: libc::pid_t) -> Option<i64> {
    #[cfg(target_os = "linux")]
    {
        linux_start_time(pid)
    }
    #[cfg(target_os = "macos")]
    {
        macos_start_time(pid)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        None
    }
}

#[cfg(target_os = "linux")]
fn linux_start_time(pid: libc::pid_t) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(format!("/proc/{pid}")).ok()?;
    let ctime_ms = meta.ctime() * 1000 + meta.ctime_nsec() / 1_000_000;
    Some(ctime_ms)
}

#[cfg(target_os = "macos")]
fn macos_start_time(pid: libc::pid_t) -> Option<i64> {
    let out = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "lstart="])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    let parsed = chrono::NaiveDateTime::parse_from_str(text, "%a %b %e %T %Y").ok()?;
    let utc = parsed.and_local_timezone(chrono::Local).single()?.with_timezone(&chrono::Utc);
    Some(utc.timestamp_millis())
}

/// Checks whether a recorded identity still matches the live process,
/// applying the spec's 2s tolerance. `None` for `observed` (platform
/// can't answer, or the process is gone) is always treated as a
/// mismatch.
pub fn matches(recorded_start_time: i64, observed_start_time: Option<i64>) -> bool {
    match observed_start_time {
        Some(observed) => (observed - recorded_start_time).abs() <= START_TIME_TOLERANCE_MS,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_within_tolerance() {
        assert!(matches(1_000_000, Some(1_000_000)));
        assert!(matches(1_000_000, Some(1_001_500)));
        assert!(matches(1_000_000, Some(998_500)));
    }

    #[test]
    fn outside_tolerance_is_rejected() {
        assert!(!matches(1_000_000, Some(1_100_000)));
    }

    #[test]
    fn none_is_always_a_mismatch() {
        assert!(!matches(1_000_000, None));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id() as libc::pid_t));
    }
}
