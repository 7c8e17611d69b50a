// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-memory backend for unit tests of the sandbox wrapper and evictor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::WorkerConfig;
use crate::error::SandboxError;
use crate::types::{RuntimeKind, SandboxId};

use super::{
    CreateRequest, ForkTarget, MemPool, RawSandbox, Sandbox, SandboxBackend, SandboxClient,
    SandboxEventKind, SandboxMeta, SandboxPool,
};

/// Backend call counters plus failure switches.
#[derive(Debug, Default)]
pub(super) struct FakeLog {
    pub pauses: AtomicUsize,
    pub unpauses: AtomicUsize,
    pub destroys: AtomicUsize,
    pub fail_pause: AtomicBool,
    pub fail_unpause: AtomicBool,
    pub live_mb: AtomicU64,
    pub peak_mb: AtomicU64,
}

struct FakeSandbox {
    mem_mb: u64,
    client: SandboxClient,
    log: Arc<FakeLog>,
}

impl RawSandbox for FakeSandbox {
    fn pause(&mut self) -> Result<(), SandboxError> {
        if self.log.fail_pause.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend {
                reason: "freeze refused".to_string(),
            });
        }
        self.log.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unpause(&mut self) -> Result<(), SandboxError> {
        if self.log.fail_unpause.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend {
                reason: "thaw refused".to_string(),
            });
        }
        self.log.unpauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self, _reason: &str) {
        self.log.live_mb.fetch_sub(self.mem_mb, Ordering::SeqCst);
        self.log.destroys.fetch_add(1, Ordering::SeqCst);
    }

    fn fork_into(&mut self, _target: &ForkTarget) -> Result<(), SandboxError> {
        Ok(())
    }

    fn client(&self) -> &SandboxClient {
        &self.client
    }

    fn mem_limit_mb(&self) -> u64 {
        self.mem_mb
    }

    fn mem_usage_mb(&self) -> Result<u64, SandboxError> {
        Ok(self.mem_mb)
    }

    fn debug_string(&self) -> String {
        "FAKE\n".to_string()
    }
}

struct FakeBackend {
    log: Arc<FakeLog>,
}

impl SandboxBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn create(
        &self,
        id: SandboxId,
        request: &CreateRequest,
        parent: Option<&Sandbox>,
    ) -> Result<Box<dyn RawSandbox>, SandboxError> {
        if let Some(parent) = parent {
            parent.fork(&ForkTarget {
                id,
                root_dir: request.scratch_dir.clone(),
                cgroup_procs: None,
            })?;
        }

        let mb = request.meta.mem_mb;
        let live = self.log.live_mb.fetch_add(mb, Ordering::SeqCst) + mb;
        self.log.peak_mb.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeSandbox {
            mem_mb: mb,
            client: SandboxClient::new(
                format!("/tmp/ol-fake-{}.sock", id),
                Duration::from_secs(1),
            )?,
            log: Arc::clone(&self.log),
        }))
    }

    fn cleanup(&self) {}
}

/// Pool of `total_mb` on the fake backend, without an evictor.
pub(super) fn fake_pool(total_mb: u64) -> (Arc<SandboxPool>, Arc<FakeLog>) {
    let log = Arc::new(FakeLog::default());
    let limits = WorkerConfig::with_worker_dir("/tmp/ol-fake/worker")
        .unwrap()
        .limits;
    let pool = SandboxPool::new(
        Box::new(FakeBackend {
            log: Arc::clone(&log),
        }),
        MemPool::new("fake", total_mb, false),
        limits,
    );
    (Arc::new(pool), log)
}

pub(super) fn request(mem_mb: u64, is_leaf: bool) -> CreateRequest {
    CreateRequest {
        code: None,
        scratch_dir: PathBuf::from("/tmp/ol-fake/scratch"),
        meta: SandboxMeta {
            mem_mb,
            ..Default::default()
        },
        runtime: RuntimeKind::Python,
        is_leaf,
        keep_scratch: false,
    }
}

pub(super) type EventLog = Arc<Mutex<Vec<(SandboxEventKind, SandboxId)>>>;

/// Record every event the pool emits.
pub(super) fn record_events(pool: &SandboxPool) -> EventLog {
    let events: EventLog = Arc::default();
    let sink = Arc::clone(&events);
    pool.add_listener(Box::new(move |event| {
        sink.lock().push((event.kind, event.sandbox.id()));
    }));
    events
}

pub(super) fn count(events: &EventLog, kind: SandboxEventKind, id: SandboxId) -> usize {
    events
        .lock()
        .iter()
        .filter(|(k, i)| *k == kind && *i == id)
        .count()
}
