// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pool of pre-created cgroup nodes.
//!
//! A background thread keeps up to [`CGROUP_RESERVE`] nodes ready, taking
//! recycled nodes before creating fresh ones, so `acquire` rarely pays for a
//! mkdir on the critical path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::WorkerConfig;
use crate::error::SandboxError;

use super::cgroup::{rmdir_retry, Cgroup};

/// Nodes kept ready (and recycled) ahead of demand.
pub const CGROUP_RESERVE: usize = 16;

/// State shared by the pool, its filler thread and every handed-out node.
#[derive(Debug)]
pub(super) struct PoolShared {
    pub(super) name: String,
    pub(super) group_path: PathBuf,
    pub(super) reuse: bool,
    pub(super) trace: bool,
    pub(super) recycled_tx: SyncSender<Cgroup>,
    procs: u64,
    swappiness: u64,
    next_id: AtomicU64,
    stopping: AtomicBool,
}

impl PoolShared {
    pub(super) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn new_cgroup(self: &Arc<Self>) -> Result<Cgroup, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cg = Cgroup::create(Arc::clone(self), format!("cg-{}", id))?;
        cg.write_int("pids.max", self.procs as i64)?;
        cg.write_int("memory.swap.max", self.swappiness as i64)?;
        Ok(cg)
    }
}

#[derive(Debug)]
pub struct CgroupPool {
    shared: Arc<PoolShared>,
    ready_rx: Mutex<Receiver<Cgroup>>,
    filler: Mutex<Option<JoinHandle<()>>>,
}

impl CgroupPool {
    /// Create `<cgroup_root>/<pool>` and start the filler thread.
    ///
    /// The pool name is `<basename of the ol dir>-<name>`, so two workers on
    /// one host do not collide.
    pub fn new(config: &WorkerConfig, name: &str) -> Result<Self, SandboxError> {
        let prefix = config
            .worker_dir
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ol".to_string());
        let pool_name = format!("{}-{}", prefix, name);
        let group_path = config.cgroup_root.join(&pool_name);

        tracing::info!(pool = %pool_name, path = %group_path.display(), "Creating cgroup pool");

        std::fs::create_dir(&group_path).map_err(|e| SandboxError::Backend {
            reason: format!("mkdir {}: {}", group_path.display(), e),
        })?;

        let control = group_path.join("cgroup.subtree_control");
        std::fs::write(&control, "+pids +io +memory +cpu").map_err(|e| {
            SandboxError::Backend {
                reason: format!("write {}: {}", control.display(), e),
            }
        })?;

        let (ready_tx, ready_rx) = sync_channel(CGROUP_RESERVE);
        let (recycled_tx, recycled_rx) = sync_channel(CGROUP_RESERVE);

        let shared = Arc::new(PoolShared {
            name: pool_name,
            group_path,
            reuse: config.features.reuse_cgroups,
            trace: config.trace.cgroups,
            recycled_tx,
            procs: config.limits.procs,
            swappiness: config.limits.swappiness,
            next_id: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        });

        let filler_shared = Arc::clone(&shared);
        let filler = std::thread::Builder::new()
            .name(format!("cgroup-pool-{}", name))
            .spawn(move || fill_task(filler_shared, ready_tx, recycled_rx))
            .map_err(|e| SandboxError::Backend {
                reason: format!("spawn cgroup filler: {}", e),
            })?;

        Ok(Self {
            shared,
            ready_rx: Mutex::new(ready_rx),
            filler: Mutex::new(Some(filler)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn group_path(&self) -> &Path {
        &self.shared.group_path
    }

    /// Take a ready node and apply memory and CPU limits.
    pub fn acquire(&self, mem_mb: u64, cpu_percent: u64) -> Result<Cgroup, SandboxError> {
        if self.shared.is_stopping() {
            return Err(SandboxError::Backend {
                reason: "cgroup pool is shutting down".to_string(),
            });
        }

        let mut cg = self
            .ready_rx
            .lock()
            .recv()
            .map_err(|_| SandboxError::Backend {
                reason: "cgroup filler thread exited".to_string(),
            })?;

        let limits = cg
            .set_mem_limit_mb(mem_mb)
            .and_then(|_| cg.set_cpu_percent(cpu_percent));
        if let Err(e) = limits {
            cg.destroy();
            return Err(e);
        }

        Ok(cg)
    }

    /// Stop the filler, destroy every pooled node and remove the pool group.
    pub fn destroy_all(&self) {
        let handle = match self.filler.lock().take() {
            Some(handle) => handle,
            None => return,
        };

        tracing::info!(pool = %self.shared.name, "Destroying cgroup pool");
        self.shared.stopping.store(true, Ordering::Release);

        // keep draining so a filler blocked on a full queue can observe the flag
        let ready_rx = self.ready_rx.lock();
        while !handle.is_finished() {
            while let Ok(cg) = ready_rx.try_recv() {
                cg.destroy();
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if handle.join().is_err() {
            tracing::error!(pool = %self.shared.name, "Cgroup filler thread panicked");
        }
        while let Ok(cg) = ready_rx.try_recv() {
            cg.destroy();
        }

        rmdir_retry(&self.shared.group_path);
    }
}

fn fill_task(shared: Arc<PoolShared>, ready_tx: SyncSender<Cgroup>, recycled_rx: Receiver<Cgroup>) {
    tracing::debug!(pool = %shared.name, "Start creating/serving cgroups");

    while !shared.is_stopping() {
        let cg = match recycled_rx.try_recv() {
            Ok(cg) => match cg.unpause() {
                Ok(()) => cg,
                Err(e) => {
                    tracing::warn!(cgroup = %cg.name(), error = %e, "Recycled cgroup stuck frozen");
                    cg.destroy();
                    continue;
                }
            },
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                match shared.new_cgroup() {
                    Ok(cg) => cg,
                    Err(e) => {
                        tracing::error!(pool = %shared.name, error = %e, "Failed to create cgroup");
                        std::thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                }
            }
        };

        if shared.is_stopping() {
            cg.destroy();
            break;
        }

        if let Err(returned) = ready_tx.send(cg) {
            returned.0.destroy();
            break;
        }
    }

    while let Ok(cg) = recycled_rx.try_recv() {
        cg.destroy();
    }
    tracing::debug!(pool = %shared.name, "Cgroup filler stopped");
}

#[cfg(test)]
pub(super) fn test_shared(root: &Path) -> Arc<PoolShared> {
    let (recycled_tx, _recycled_rx) = sync_channel(CGROUP_RESERVE);
    Arc::new(PoolShared {
        name: "test".to_string(),
        group_path: root.to_path_buf(),
        reuse: false,
        trace: false,
        recycled_tx,
        procs: 10,
        swappiness: 0,
        next_id: AtomicU64::new(0),
        stopping: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> WorkerConfig {
        let mut config = WorkerConfig::with_worker_dir(tmp.path().join("ol").join("worker")).unwrap();
        config.cgroup_root = tmp.path().join("cgroupfs");
        std::fs::create_dir_all(&config.cgroup_root).unwrap();
        config
    }

    #[test]
    fn test_pool_layout_and_acquire() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let pool = CgroupPool::new(&config, "sandboxes").unwrap();

        assert_eq!(pool.name(), "ol-sandboxes");
        assert_eq!(
            std::fs::read_to_string(pool.group_path().join("cgroup.subtree_control")).unwrap(),
            "+pids +io +memory +cpu"
        );

        let cg = pool.acquire(32, 100).unwrap();
        assert!(cg.name().starts_with("cg-"));
        assert_eq!(cg.read_int("pids.max").unwrap(), 10);
        assert_eq!(cg.read_int("memory.swap.max").unwrap(), 0);
        assert_eq!(cg.read_int("memory.max").unwrap(), 32 * 1024 * 1024);
        assert_eq!(cg.mem_limit_mb(), 32);
    }

    #[test]
    fn test_unique_names() {
        let tmp = TempDir::new().unwrap();
        let pool = CgroupPool::new(&config(&tmp), "p").unwrap();

        let a = pool.acquire(10, 50).unwrap();
        let b = pool.acquire(10, 50).unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_concurrent_acquire_hands_out_distinct_nodes() {
        let tmp = TempDir::new().unwrap();
        let pool = CgroupPool::new(&config(&tmp), "busy").unwrap();

        let held: Vec<Cgroup> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..CGROUP_RESERVE + 4)
                .map(|_| scope.spawn(|| pool.acquire(16, 100).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let paths: std::collections::HashSet<PathBuf> =
            held.iter().map(|cg| cg.path().to_path_buf()).collect();
        assert_eq!(paths.len(), held.len());
        assert!(paths.iter().all(|p| p.starts_with(pool.group_path())));
    }

    #[test]
    fn test_duplicate_pool_fails() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let _pool = CgroupPool::new(&config, "dup").unwrap();
        assert!(matches!(
            CgroupPool::new(&config, "dup"),
            Err(SandboxError::Backend { .. })
        ));
    }
}
