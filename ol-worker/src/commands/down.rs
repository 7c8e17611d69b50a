// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol down` command - Stop a running worker.
//!
//! Sends SIGTERM to the PID in `worker.pid` and waits for the worker to
//! remove the file on its way out.

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::CmdResult;

const STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn execute(worker_dir: &Path) -> CmdResult {
    let pid_path = worker_dir.join("worker.pid");
    let raw = match std::fs::read_to_string(&pid_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No worker running in {}", worker_dir.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|e| format!("bad PID file {}: {}", pid_path.display(), e))?;

    tracing::info!(pid, "Stopping worker");
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            // the process is gone but never cleaned up after itself
            std::fs::remove_file(&pid_path)?;
            println!("Worker {} was not running; removed stale PID file", pid);
            return Ok(());
        }
        return Err(format!("cannot signal worker {}: {}", pid, e).into());
    }

    let start = Instant::now();
    while pid_path.exists() {
        if start.elapsed() > STOP_TIMEOUT {
            return Err(format!(
                "worker {} did not stop within {}s",
                pid,
                STOP_TIMEOUT.as_secs()
            )
            .into());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("✓ Worker {} stopped", pid);
    Ok(())
}
