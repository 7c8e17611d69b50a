// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! A single cgroup v2 node handed out by the [`CgroupPool`](super::CgroupPool).

use std::path::{Path, PathBuf};
use std::sync::mpsc::TrySendError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SandboxError;

use super::pool::PoolShared;

const MB: u64 = 1024 * 1024;
const CPU_PERIOD_US: u64 = 100_000;
const FREEZE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: usize = 100;
const RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Exclusive handle on one `cg-<n>` node.
///
/// Dropping a `Cgroup` without calling [`Cgroup::release`] leaks the node
/// until the pool is destroyed.
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    path: PathBuf,
    mem_limit_mb: u64,
    pool: Arc<PoolShared>,
}

impl Cgroup {
    pub(super) fn create(pool: Arc<PoolShared>, name: String) -> Result<Self, SandboxError> {
        let path = pool.group_path.join(&name);
        std::fs::create_dir(&path).map_err(|e| SandboxError::Cgroup {
            path: path.clone(),
            reason: format!("mkdir: {}", e),
        })?;

        let cg = Self {
            name,
            path,
            mem_limit_mb: 0,
            pool,
        };
        cg.trace("created");
        Ok(cg)
    }

    fn trace(&self, msg: &str) {
        if self.pool.trace {
            tracing::debug!(pool = %self.pool.name, cgroup = %self.name, "{}", msg);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resource_path(&self, resource: &str) -> PathBuf {
        self.path.join(resource)
    }

    pub fn procs_path(&self) -> PathBuf {
        self.resource_path("cgroup.procs")
    }

    fn err(&self, resource: &str, reason: impl std::fmt::Display) -> SandboxError {
        SandboxError::Cgroup {
            path: self.resource_path(resource),
            reason: reason.to_string(),
        }
    }

    pub fn write_str(&self, resource: &str, value: &str) -> Result<(), SandboxError> {
        std::fs::write(self.resource_path(resource), value)
            .map_err(|e| self.err(resource, format!("write {:?}: {}", value, e)))
    }

    pub fn write_int(&self, resource: &str, value: i64) -> Result<(), SandboxError> {
        self.write_str(resource, &value.to_string())
    }

    pub fn read_int(&self, resource: &str) -> Result<i64, SandboxError> {
        let raw = std::fs::read_to_string(self.resource_path(resource))
            .map_err(|e| self.err(resource, e))?;
        raw.trim()
            .parse()
            .map_err(|e| self.err(resource, format!("parse {:?}: {}", raw.trim(), e)))
    }

    /// Value of `key` in a flat-keyed file such as `memory.events`.
    pub fn read_int_kv(&self, resource: &str, key: &str) -> Result<i64, SandboxError> {
        let raw = std::fs::read_to_string(self.resource_path(resource))
            .map_err(|e| self.err(resource, e))?;

        raw.lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(k, _)| *k == key)
            .ok_or_else(|| self.err(resource, format!("no key {:?}", key)))
            .and_then(|(_, v)| {
                v.trim()
                    .parse()
                    .map_err(|e| self.err(resource, format!("parse {:?}: {}", v, e)))
            })
    }

    /// Move a process into this cgroup.
    pub fn add_pid(&self, pid: u32) -> Result<(), SandboxError> {
        self.write_str("cgroup.procs", &pid.to_string())
    }

    pub fn pids(&self) -> Result<Vec<u32>, SandboxError> {
        let raw = std::fs::read_to_string(self.procs_path())
            .map_err(|e| self.err("cgroup.procs", e))?;
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Set `memory.max` and verify the kernel kept it within 1 MiB.
    pub fn set_mem_limit_mb(&mut self, mb: u64) -> Result<(), SandboxError> {
        if mb == self.mem_limit_mb {
            return Ok(());
        }

        let bytes = (mb * MB) as i64;
        self.write_int("memory.max", bytes)?;

        let actual = self.read_int("memory.max")?;
        if (actual - bytes).unsigned_abs() > MB {
            return Err(self.err(
                "memory.max",
                format!("set {} but kernel reports {} (1MB tolerance)", bytes, actual),
            ));
        }

        self.mem_limit_mb = mb;
        Ok(())
    }

    pub fn mem_limit_mb(&self) -> u64 {
        self.mem_limit_mb
    }

    /// `memory.current`, rounded up to whole MB.
    pub fn mem_usage_mb(&self) -> Result<u64, SandboxError> {
        let usage = self.read_int("memory.current")?.max(0) as u64;
        Ok(usage.div_ceil(MB))
    }

    /// Limit CPU to `percent` of one core.
    pub fn set_cpu_percent(&self, percent: u64) -> Result<(), SandboxError> {
        let quota = CPU_PERIOD_US * percent / 100;
        self.write_str("cpu.max", &format!("{} {}", quota, CPU_PERIOD_US))
    }

    pub fn pause(&self) -> Result<(), SandboxError> {
        self.set_freeze_state(1)
    }

    pub fn unpause(&self) -> Result<(), SandboxError> {
        self.set_freeze_state(0)
    }

    fn set_freeze_state(&self, state: i64) -> Result<(), SandboxError> {
        self.write_int("cgroup.freeze", state)?;

        let start = Instant::now();
        loop {
            if self.read_int("cgroup.freeze")? == state {
                return Ok(());
            }
            if start.elapsed() > FREEZE_TIMEOUT {
                return Err(SandboxError::Timeout {
                    operation: if state == 1 { "cgroup freeze" } else { "cgroup thaw" },
                    after_ms: FREEZE_TIMEOUT.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// SIGKILL every process in the group.
    pub fn kill_all(&self) -> Result<(), SandboxError> {
        self.write_int("cgroup.kill", 1)
    }

    /// Return the node to the pool, or remove it.
    pub fn release(self) {
        if self.pool.reuse && !self.pool.is_stopping() && self.wait_empty() {
            let pool = Arc::clone(&self.pool);
            match pool.recycled_tx.try_send(self) {
                Ok(()) => return,
                Err(TrySendError::Full(cg)) | Err(TrySendError::Disconnected(cg)) => {
                    cg.trace("recycle queue unavailable");
                    cg.destroy();
                }
            }
            return;
        }

        self.trace("release and destroy");
        self.destroy();
    }

    fn wait_empty(&self) -> bool {
        for _ in 0..RETRY_ATTEMPTS {
            match self.pids() {
                Ok(pids) if pids.is_empty() => return true,
                Ok(_) => std::thread::sleep(RETRY_BACKOFF),
                Err(e) => {
                    tracing::warn!(cgroup = %self.name, error = %e, "Cannot read cgroup pids");
                    return false;
                }
            }
        }
        tracing::warn!(cgroup = %self.name, "Cgroup still has processes, not recycling");
        false
    }

    /// rmdir with retries; a node that never goes away is logged and leaked.
    pub(super) fn destroy(self) {
        self.trace("destroy");
        rmdir_retry(&self.path);
    }

    /// PIDs, freeze state, memory and OOM kills.
    pub fn debug_string(&self) -> String {
        let mut s = String::new();

        match self.pids() {
            Ok(pids) => {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                s += &format!("CGROUP PIDS: {}\n", pids.join(", "));
            }
            Err(e) => s += &format!("CGROUP PIDS: unknown ({})\n", e),
        }

        s += &format!("CGROUP: {}\n", self.path.display());

        match self.read_int("cgroup.freeze") {
            Ok(state) => s += &format!("FREEZE STATE: {}\n", state),
            Err(e) => s += &format!("FREEZE STATE: unknown ({})\n", e),
        }

        match self.mem_usage_mb() {
            Ok(used) => s += &format!("MEMORY USED: {} of {} MB\n", used, self.mem_limit_mb),
            Err(e) => s += &format!("MEMORY USED: unknown ({})\n", e),
        }

        match self.read_int_kv("memory.events", "oom_kill") {
            Ok(kills) => s += &format!("OOM KILLS: {}\n", kills),
            Err(e) => s += &format!("OOM KILLS: unknown ({})\n", e),
        }

        s
    }
}

pub(super) fn rmdir_retry(path: &Path) {
    for attempt in 0..RETRY_ATTEMPTS {
        match std::fs::remove_dir(path) {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if attempt + 1 == RETRY_ATTEMPTS => {
                tracing::error!(path = %path.display(), error = %e, "Rmdir failed, leaking cgroup");
            }
            Err(_) => std::thread::sleep(RETRY_BACKOFF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::pool::test_shared;
    use super::*;
    use tempfile::TempDir;

    fn fresh(tmp: &TempDir) -> Cgroup {
        let cg = Cgroup::create(test_shared(tmp.path()), "cg-1".to_string()).unwrap();
        // plain files stand in for cgroupfs
        for (file, value) in [
            ("cgroup.procs", ""),
            ("cgroup.freeze", "0"),
            ("memory.current", "3145728"),
            ("memory.events", "low 0\nhigh 0\nmax 2\noom 1\noom_kill 1\n"),
        ] {
            std::fs::write(cg.resource_path(file), value).unwrap();
        }
        cg
    }

    #[test]
    fn test_limits() {
        let tmp = TempDir::new().unwrap();
        let mut cg = fresh(&tmp);

        cg.set_mem_limit_mb(64).unwrap();
        assert_eq!(cg.read_int("memory.max").unwrap(), 64 * 1024 * 1024);
        assert_eq!(cg.mem_limit_mb(), 64);

        cg.set_cpu_percent(50).unwrap();
        assert_eq!(
            std::fs::read_to_string(cg.resource_path("cpu.max")).unwrap(),
            "50000 100000"
        );
    }

    #[test]
    fn test_usage_rounds_up() {
        let tmp = TempDir::new().unwrap();
        let cg = fresh(&tmp);
        assert_eq!(cg.mem_usage_mb().unwrap(), 3);

        std::fs::write(cg.resource_path("memory.current"), "3145729").unwrap();
        assert_eq!(cg.mem_usage_mb().unwrap(), 4);
    }

    #[test]
    fn test_freeze_readback() {
        let tmp = TempDir::new().unwrap();
        let cg = fresh(&tmp);

        cg.pause().unwrap();
        assert_eq!(cg.read_int("cgroup.freeze").unwrap(), 1);
        cg.unpause().unwrap();
        assert_eq!(cg.read_int("cgroup.freeze").unwrap(), 0);
    }

    #[test]
    fn test_pids_and_events() {
        let tmp = TempDir::new().unwrap();
        let cg = fresh(&tmp);
        assert!(cg.pids().unwrap().is_empty());

        std::fs::write(cg.procs_path(), "12\n34\n").unwrap();
        assert_eq!(cg.pids().unwrap(), vec![12, 34]);
        assert_eq!(cg.read_int_kv("memory.events", "oom_kill").unwrap(), 1);
        assert!(cg.read_int_kv("memory.events", "missing").is_err());

        let dump = cg.debug_string();
        assert!(dump.contains("CGROUP PIDS: 12, 34"));
        assert!(dump.contains("OOM KILLS: 1"));
    }
}
