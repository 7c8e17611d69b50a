// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Memory-pressure eviction of idle sandboxes.
//!
//! Priority of a sandbox is `2 * live_children`, plus one while unpaused.
//! Lower priority is always evicted first; sandboxes with children are
//! never evicted, since their memory cannot come back until every
//! descendant exits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::types::SandboxId;

use super::mem_pool::MemPool;
use super::{Sandbox, SandboxEventKind, SandboxListener};

/// Share of the pool (beyond two sandboxes) we try to keep free.
const FREE_SANDBOXES_PERCENT_GOAL: i64 = 20;

const CONCURRENT_EVICTIONS: i64 = 8;

/// Queues for priority 0 (paused, childless), 1 (running, childless), 2+.
const PRIO_QUEUES: usize = 3;

const ROUND_INTERVAL: Duration = Duration::from_millis(100);

enum EvictorMsg {
    Event(SandboxEventKind, Arc<Sandbox>),
    Shutdown(mpsc::SyncSender<()>),
}

/// Handle to the eviction thread.
pub struct Evictor {
    tx: Sender<EvictorMsg>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Evictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evictor").finish_non_exhaustive()
    }
}

impl Evictor {
    /// Start the eviction thread. The returned listener must be registered
    /// on the sandbox pool.
    pub fn start(
        mem: Arc<MemPool>,
        sandbox_mb: u64,
        trace: bool,
    ) -> Result<(Self, SandboxListener), std::io::Error> {
        let (tx, rx) = mpsc::channel();
        let state = EvictorState::new(mem, sandbox_mb, trace);

        let handle = std::thread::Builder::new()
            .name("ol-evictor".to_string())
            .spawn(move || state.run(rx))?;

        let listener_tx = parking_lot::Mutex::new(tx.clone());
        let listener: SandboxListener = Box::new(move |event| {
            // the thread is gone only after shutdown
            let _ = listener_tx
                .lock()
                .send(EvictorMsg::Event(event.kind, Arc::clone(&event.sandbox)));
        });

        Ok((
            Self {
                tx,
                handle: Some(handle),
            },
            listener,
        ))
    }

    /// Stop the thread and wait for it to acknowledge.
    pub fn shutdown(mut self) {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        if self.tx.send(EvictorMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Evictor thread panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queue(usize),
    Evicting,
}

struct Entry {
    sandbox: Arc<Sandbox>,
    prio: i64,
    slot: Slot,
}

struct EvictorState {
    mem: Arc<MemPool>,
    sandbox_mb: i64,
    trace: bool,
    entries: HashMap<SandboxId, Entry>,
    queues: [VecDeque<SandboxId>; PRIO_QUEUES],
    evicting: HashSet<SandboxId>,
}

impl EvictorState {
    fn new(mem: Arc<MemPool>, sandbox_mb: u64, trace: bool) -> Self {
        Self {
            mem,
            sandbox_mb: sandbox_mb.max(1) as i64,
            trace,
            entries: HashMap::new(),
            queues: Default::default(),
            evicting: HashSet::new(),
        }
    }

    fn run(mut self, rx: Receiver<EvictorMsg>) {
        loop {
            let first = match rx.recv_timeout(ROUND_INTERVAL) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            };

            let mut next = first;
            while let Some(msg) = next {
                match msg {
                    EvictorMsg::Event(kind, sandbox) => self.update(kind, sandbox),
                    EvictorMsg::Shutdown(reply) => {
                        tracing::debug!(tracked = self.entries.len(), "Evictor stopping");
                        let _ = reply.send(());
                        return;
                    }
                }
                next = rx.try_recv().ok();
            }

            self.do_evictions();
        }
    }

    fn update(&mut self, kind: SandboxEventKind, sandbox: Arc<Sandbox>) {
        let id = sandbox.id();
        let prio = self.entries.get(&id).map(|e| e.prio).unwrap_or(0);

        let prio = match kind {
            SandboxEventKind::Create => {
                if prio != 0 {
                    tracing::error!(sandbox = %id, prio, "Sandbox not at priority 0 on create");
                    std::process::abort();
                }
                prio + 1
            }
            SandboxEventKind::Unpause => prio + 1,
            SandboxEventKind::Pause => prio - 1,
            SandboxEventKind::Fork => prio + 2,
            SandboxEventKind::ChildExit => prio - 2,
            SandboxEventKind::Destroy | SandboxEventKind::DestroyIgnored => prio,
        };

        if self.trace {
            tracing::debug!(sandbox = %id, event = ?kind, prio, "Evictor priority update");
        }
        if prio < 0 {
            tracing::error!(sandbox = %id, prio, "Sandbox priority went negative");
            std::process::abort();
        }

        if kind == SandboxEventKind::Destroy {
            self.remove(id);
            return;
        }

        let queue = (prio as usize).min(PRIO_QUEUES - 1);
        self.detach(id);
        self.queues[queue].push_back(id);
        self.entries.insert(
            id,
            Entry {
                sandbox,
                prio,
                slot: Slot::Queue(queue),
            },
        );
    }

    fn detach(&mut self, id: SandboxId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        match entry.slot {
            Slot::Queue(q) => self.queues[q].retain(|x| *x != id),
            Slot::Evicting => {
                self.evicting.remove(&id);
            }
        }
    }

    fn remove(&mut self, id: SandboxId) {
        self.detach(id);
        self.entries.remove(&id);
    }

    fn evict_front(&mut self, queue: usize, force: bool) {
        let Some(id) = self.queues[queue].pop_front() else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.slot = Slot::Evicting;
        self.evicting.insert(id);
        let sandbox = Arc::clone(&entry.sandbox);

        if self.trace {
            tracing::debug!(sandbox = %id, force, "Evicting sandbox");
        }

        // completion shows up later as a Destroy or DestroyIgnored event
        let spawned = std::thread::Builder::new()
            .name("ol-evict".to_string())
            .spawn(move || {
                if force {
                    sandbox.destroy("forced eviction");
                } else {
                    sandbox.destroy_if_paused("idle eviction");
                }
            });
        if let Err(e) = spawned {
            tracing::error!(sandbox = %id, error = %e, "Could not spawn eviction");
        }
    }

    fn do_evictions(&mut self) {
        let available = self.mem.available() as i64;
        let (free, mut count) = eviction_budget(
            available,
            self.mem.total() as i64,
            self.sandbox_mb,
            self.evicting.len() as i64,
        );

        while count > 0 && !self.queues[0].is_empty() {
            self.evict_front(0, false);
            count -= 1;
        }

        // interrupting a request beats stalling every creator
        if free <= 0 && self.evicting.is_empty() && !self.queues[1].is_empty() {
            tracing::warn!(available, "Critically low on memory, evicting an active sandbox");
            self.evict_front(1, true);
        }
    }
}

/// Returns `(free_sandboxes, evictions_wanted)`.
fn eviction_budget(available: i64, total: i64, sandbox_mb: i64, evicting: i64) -> (i64, i64) {
    let free = available / sandbox_mb;
    let goal = 1 + (total / sandbox_mb - 2) * FREE_SANDBOXES_PERCENT_GOAL / 100;
    let cap = CONCURRENT_EVICTIONS - evicting;
    (free, (goal - free).min(cap))
}
