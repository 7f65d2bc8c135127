//! Shared helpers used by multiple sensor source implementations.
//!
//! Bounded execution (threads and subprocesses that can be abandoned),
//! sysfs value parsing, and the process-local monotonic clock.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::sync::mpsc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Monotonic clock
// ---------------------------------------------------------------------------

/// Milliseconds elapsed since the first call in this process.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// Bounded execution
// ---------------------------------------------------------------------------

/// Run `f` on a helper thread and wait at most `timeout` for its result.
///
/// Returns `None` on timeout or if `f` panicked. A timed-out thread is
/// detached and left to finish on its own; its result is discarded.
pub fn run_with_timeout<T, F>(timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("upsentinel-sample".into())
        .spawn(move || {
            let _ = tx.send(f());
        });
    if spawned.is_err() {
        return None;
    }
    rx.recv_timeout(timeout).ok()
}

/// Run a subprocess and return its trimmed stdout, killing it after `timeout`.
///
/// Returns `None` if the command is missing, exits non-zero, prints nothing,
/// or runs too long.
pub fn run_command(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    // Drain stdout on a side thread so a chatty child can't fill the pipe and stall.
    let mut stdout = child.stdout.take()?;
    let reader = std::thread::spawn(move || {
        let mut out = Vec::new();
        let _ = stdout.read_to_end(&mut out);
        out
    });

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let out = reader.join().unwrap_or_default();
                if !status.success() {
                    return None;
                }
                let s = String::from_utf8_lossy(&out).trim().to_string();
                return if s.is_empty() { None } else { Some(s) };
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// sysfs values
// ---------------------------------------------------------------------------

/// Read a sysfs attribute, trimmed. `None` if missing or empty.
pub fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let v = raw.trim();
    if v.is_empty() { None } else { Some(v.to_string()) }
}

/// Read a sysfs attribute as an integer.
pub fn read_i64(path: &Path) -> Option<i64> {
    read_trimmed(path)?.parse().ok()
}

/// Read a thermal-zone temperature (millidegrees) as °C.
pub fn read_thermal_c(path: &Path) -> Option<f64> {
    let milli = read_i64(path)?;
    let c = milli as f64 / 1000.0;
    // Zones that are present but unpopulated report absurd values.
    if (-40.0..=150.0).contains(&c) { Some(c) } else { None }
}
