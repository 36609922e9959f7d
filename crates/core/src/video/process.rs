//! Scoped FFmpeg child process: machine-readable progress on stdout,
//! diagnostics on stderr, guaranteed termination on cancellation or drop.

use std::io::{BufRead, BufReader};
use std::process::{Child, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Canceled;

/// Kills the child when the guard leaves scope without a clean wait.
struct ChildGuard {
    child: Child,
    finished: bool,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Run `ffmpeg` with the given args, streaming `key=value` progress lines
/// (from `-progress pipe:1`) into `on_progress`. Cancellation terminates
/// the process and surfaces as [`Canceled`]. On failure the last stderr
/// line is attached to the error.
pub fn run_ffmpeg_with_progress(
    args: &[String],
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(&str, &str),
) -> Result<()> {
    debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching ffmpeg");

    let mut child = crate::runtime::command_for("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg — is it installed?")?;

    let stdout = child.stdout.take().expect("stdout should be piped");
    let stderr = child.stderr.take().expect("stderr should be piped");
    let stderr_thread: JoinHandle<Option<String>> = thread::spawn(move || {
        let mut last = None;
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    debug!(target: "ffmpeg_stderr", "{}", line);
                    last = Some(line);
                }
                Err(_) => break,
                _ => {}
            }
        }
        last
    });

    let mut guard = ChildGuard {
        child,
        finished: false,
    };

    for line in BufReader::new(stdout).lines() {
        if cancel.is_cancelled() {
            let _ = guard.child.kill();
            let _ = guard.child.wait();
            guard.finished = true;
            let _ = stderr_thread.join();
            return Err(anyhow::Error::new(Canceled));
        }
        let Ok(line) = line else { break };
        if let Some((key, value)) = parse_progress_line(&line) {
            on_progress(key, value);
        }
    }

    let status = guard.child.wait().context("failed to wait for ffmpeg")?;
    guard.finished = true;
    let last_stderr = stderr_thread.join().ok().flatten();

    if cancel.is_cancelled() {
        return Err(anyhow::Error::new(Canceled));
    }
    if !status.success() {
        bail!(
            "ffmpeg exited with status {}: {}",
            status,
            last_stderr.as_deref().unwrap_or("no diagnostic output")
        );
    }
    Ok(())
}

/// Split one `key=value` progress line; whitespace is trimmed.
pub fn parse_progress_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// ffmpeg reports elapsed output time as `out_time_us` (and the
/// misleadingly named `out_time_ms`, also microseconds). Returns seconds.
pub fn progress_elapsed_secs(key: &str, value: &str) -> Option<f64> {
    if key != "out_time_us" && key != "out_time_ms" {
        return None;
    }
    value.parse::<f64>().ok().map(|us| us / 1_000_000.0)
}
