// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Sandbox pool: wraps a backend with memory accounting, listener
//! fan-out and the parent/child tree.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::{Limits, SandboxKind, WorkerConfig};
use crate::error::SandboxError;
use crate::types::SandboxId;

use super::daemon::{DaemonBackend, DaemonKind};
use super::evictor::Evictor;
use super::mem_pool::MemPool;
use super::safe::{Sandbox, SandboxParts};
use super::sock::SockBackend;
use super::{CreateRequest, SandboxBackend, SandboxListener};

/// State shared between the pool and every sandbox it created.
pub(crate) struct PoolShared {
    pub(super) listeners: RwLock<Vec<SandboxListener>>,
    pub(super) live: DashMap<SandboxId, Weak<Sandbox>>,
    tree: Mutex<HashMap<SandboxId, HashSet<SandboxId>>>,
}

impl PoolShared {
    fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            live: DashMap::new(),
            tree: Mutex::new(HashMap::new()),
        }
    }

    pub(super) fn add_child(&self, parent: SandboxId, child: SandboxId) {
        self.tree.lock().entry(parent).or_default().insert(child);
    }

    /// Returns whether `child` was registered under `parent`.
    pub(super) fn remove_child(&self, parent: SandboxId, child: SandboxId) -> bool {
        let mut tree = self.tree.lock();
        let Some(children) = tree.get_mut(&parent) else {
            return false;
        };
        let removed = children.remove(&child);
        if children.is_empty() {
            tree.remove(&parent);
        }
        removed
    }

    pub(super) fn has_children(&self, parent: SandboxId) -> bool {
        self.tree
            .lock()
            .get(&parent)
            .is_some_and(|children| !children.is_empty())
    }
}

pub struct SandboxPool {
    backend: Box<dyn SandboxBackend>,
    shared: Arc<PoolShared>,
    mem: Arc<MemPool>,
    limits: Limits,
    next_id: AtomicU64,
    evictor: Mutex<Option<Evictor>>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("backend", &self.backend.kind())
            .field("live", &self.shared.live.len())
            .field("mem", &self.mem)
            .finish()
    }
}

impl SandboxPool {
    pub fn new(backend: Box<dyn SandboxBackend>, mem: Arc<MemPool>, limits: Limits) -> Self {
        Self {
            backend,
            shared: Arc::new(PoolShared::new()),
            mem,
            limits,
            next_id: AtomicU64::new(1),
            evictor: Mutex::new(None),
        }
    }

    /// Build the configured backend, its memory pool and evictor.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, SandboxError> {
        let mem = MemPool::new("sandboxes", config.mem_pool_mb, config.trace.memory);

        let backend: Box<dyn SandboxBackend> = match config.sandbox {
            SandboxKind::Sock => Box::new(SockBackend::new(config, Arc::clone(&mem), "sandboxes")?),
            SandboxKind::Docker => Box::new(DaemonBackend::new(config, DaemonKind::Docker)?),
            SandboxKind::Containerd => {
                Box::new(DaemonBackend::new(config, DaemonKind::Containerd)?)
            }
        };

        tracing::info!(
            backend = backend.kind(),
            mem_pool_mb = config.mem_pool_mb,
            "Sandbox pool ready"
        );

        let pool = Self::new(backend, mem, config.limits.clone());
        pool.start_evictor(config.limits.mem_mb, config.trace.evictor)?;
        Ok(pool)
    }

    /// Attach a memory-pressure evictor.
    pub fn start_evictor(&self, sandbox_mb: u64, trace: bool) -> Result<(), SandboxError> {
        let (evictor, listener) = Evictor::start(Arc::clone(&self.mem), sandbox_mb, trace)
            .map_err(|e| SandboxError::Backend {
                reason: format!("starting evictor: {}", e),
            })?;
        self.add_listener(listener);
        if let Some(previous) = self.evictor.lock().replace(evictor) {
            previous.shutdown();
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: SandboxListener) {
        self.shared.listeners.write().push(listener);
    }

    pub fn mem(&self) -> &Arc<MemPool> {
        &self.mem
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Create a sandbox, forking from `parent` when given. Blocks while the
    /// memory pool is exhausted.
    pub fn create(
        &self,
        request: &CreateRequest,
        parent: Option<&Arc<Sandbox>>,
    ) -> Result<Arc<Sandbox>, SandboxError> {
        let mut request = request.clone();
        request.meta.fill_defaults(&self.limits);

        let reservation = self.mem.reserve(request.meta.mem_mb)?;
        let id = SandboxId::new(self.next_id.fetch_add(1, Ordering::SeqCst));

        let raw = match self.backend.create(id, &request, parent.map(Arc::as_ref)) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(sandbox = %id, error = %e, "Sandbox create failed");
                if let Some(parent) = parent {
                    parent.child_exit(id);
                }
                return Err(e);
            }
        };

        let sandbox = Sandbox::new(
            SandboxParts {
                id,
                meta: request.meta,
                runtime: request.runtime,
                is_leaf: request.is_leaf,
                code: request.code,
                raw,
                reservation,
                parent: parent.cloned(),
            },
            Arc::clone(&self.shared),
        );
        self.shared.live.insert(id, Arc::downgrade(&sandbox));
        sandbox.announce();

        tracing::debug!(
            sandbox = %id,
            parent = ?parent.map(|p| p.id()),
            meta = %sandbox.meta(),
            "Created sandbox"
        );
        Ok(sandbox)
    }

    /// Sandboxes that are not yet Dead, in id order.
    pub fn live(&self) -> Vec<Arc<Sandbox>> {
        let mut live: Vec<Arc<Sandbox>> = self
            .shared
            .live
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        live.sort_by_key(|sb| sb.id());
        live
    }

    pub fn debug_string(&self) -> String {
        self.live()
            .iter()
            .map(|sb| sb.debug_string())
            .collect::<Vec<_>>()
            .join("--------\n")
    }

    /// Destroy every sandbox, then release backend-wide state.
    pub fn cleanup(&self) {
        if let Some(evictor) = self.evictor.lock().take() {
            evictor.shutdown();
        }

        // children first so parents finalize without lingering in Dying
        let mut live = self.live();
        live.reverse();
        for sandbox in live {
            sandbox.destroy("shutdown");
        }

        self.backend.cleanup();

        let available = self.mem.available();
        if available != self.mem.total() {
            tracing::warn!(
                available,
                total = self.mem.total(),
                "Memory pool not fully released after cleanup"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::sandbox::fake::{fake_pool, request};

    #[test]
    fn test_concurrent_creates_stay_within_pool() {
        let (pool, log) = fake_pool(100);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = &pool;
                scope.spawn(move || {
                    for _ in 0..5 {
                        let sb = pool.create(&request(30, true), None).unwrap();
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        sb.destroy("done");
                    }
                });
            }
        });

        assert_eq!(log.destroys.load(Ordering::SeqCst), 40);
        assert!(log.peak_mb.load(Ordering::SeqCst) <= 90);
        assert_eq!(pool.mem().available(), 100);
        assert!(pool.live().is_empty());
    }

    #[test]
    fn test_create_fills_defaults_and_tracks_live() {
        let (pool, _log) = fake_pool(1000);
        let a = pool.create(&request(0, true), None).unwrap();
        let b = pool.create(&request(40, true), None).unwrap();

        assert_eq!(a.meta().mem_mb, pool.limits().mem_mb);
        assert_eq!(
            pool.mem().available(),
            1000 - pool.limits().mem_mb - 40
        );
        let ids: Vec<SandboxId> = pool.live().iter().map(|sb| sb.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);

        pool.cleanup();
        assert!(a.is_dead() && b.is_dead());
        assert_eq!(pool.mem().available(), 1000);
    }
}
