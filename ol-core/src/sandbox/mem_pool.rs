// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Global memory accounting for sandboxes.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::SandboxError;

#[derive(Debug)]
struct MemState {
    available_mb: u64,
    next_ticket: u64,
    now_serving: u64,
}

/// Fixed MB budget shared by every sandbox. Waiters are served FIFO so a
/// large request cannot be starved by a stream of small ones.
#[derive(Debug)]
pub struct MemPool {
    name: String,
    total_mb: u64,
    state: Mutex<MemState>,
    cond: Condvar,
    trace: bool,
}

impl MemPool {
    pub fn new(name: impl Into<String>, total_mb: u64, trace: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            total_mb,
            state: Mutex::new(MemState {
                available_mb: total_mb,
                next_ticket: 0,
                now_serving: 0,
            }),
            cond: Condvar::new(),
            trace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> u64 {
        self.total_mb
    }

    pub fn available(&self) -> u64 {
        self.state.lock().available_mb
    }

    /// Block until `mb` are free, then take them.
    pub fn acquire(&self, mb: u64) -> Result<(), SandboxError> {
        if mb > self.total_mb {
            return Err(SandboxError::Capacity {
                requested_mb: mb,
                total_mb: self.total_mb,
            });
        }

        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.now_serving != ticket || state.available_mb < mb {
            self.cond.wait(&mut state);
        }

        state.available_mb -= mb;
        state.now_serving += 1;
        let available = state.available_mb;
        drop(state);

        // the next ticket holder may be able to proceed
        self.cond.notify_all();

        if self.trace {
            tracing::debug!(pool = %self.name, mb, available, "Acquired memory");
        }
        Ok(())
    }

    pub fn release(&self, mb: u64) {
        let mut state = self.state.lock();
        state.available_mb += mb;
        if state.available_mb > self.total_mb {
            tracing::error!(
                pool = %self.name,
                available = state.available_mb,
                total = self.total_mb,
                "Memory pool over-released"
            );
        }
        let available = state.available_mb;
        drop(state);

        self.cond.notify_all();

        if self.trace {
            tracing::debug!(pool = %self.name, mb, available, "Released memory");
        }
    }

    /// Acquire `mb` behind a guard that gives them back on drop.
    pub fn reserve(self: &Arc<Self>, mb: u64) -> Result<MemReservation, SandboxError> {
        self.acquire(mb)?;
        Ok(MemReservation {
            pool: Arc::clone(self),
            mb,
        })
    }
}

/// MB held against a [`MemPool`] until dropped.
#[derive(Debug)]
pub struct MemReservation {
    pool: Arc<MemPool>,
    mb: u64,
}

impl MemReservation {
    pub fn mb(&self) -> u64 {
        self.mb
    }

    /// Record that the holder now accounts for `mb`; the difference was
    /// already moved to or from the pool by the holder.
    pub fn set_mb(&mut self, mb: u64) {
        self.mb = mb;
    }
}

impl Drop for MemReservation {
    fn drop(&mut self) {
        self.pool.release(self.mb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_acquire_release() {
        let pool = MemPool::new("test", 100, false);
        pool.acquire(60).unwrap();
        assert_eq!(pool.available(), 40);
        pool.release(60);
        assert_eq!(pool.available(), 100);
    }

    #[test]
    fn test_over_capacity_rejected() {
        let pool = MemPool::new("test", 100, false);
        assert!(matches!(
            pool.acquire(101),
            Err(SandboxError::Capacity { requested_mb: 101, total_mb: 100 })
        ));
        assert_eq!(pool.available(), 100);
    }

    #[test]
    fn test_reservation_guard() {
        let pool = MemPool::new("test", 100, false);
        {
            let _r = pool.reserve(30).unwrap();
            assert_eq!(pool.available(), 70);
        }
        assert_eq!(pool.available(), 100);
    }

    #[test]
    fn test_blocks_until_released() {
        let pool = MemPool::new("test", 100, false);
        pool.acquire(80).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                pool.acquire(50).unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        assert_eq!(pool.available(), 20);

        pool.release(80);
        waiter.join().unwrap();
        assert_eq!(pool.available(), 50);
    }

    #[test]
    fn test_fifo_order() {
        let pool = MemPool::new("test", 100, false);
        pool.acquire(100).unwrap();

        // big request queues first; a later small one must not overtake it
        let big = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire(90).unwrap())
        };
        std::thread::sleep(Duration::from_millis(30));
        let small = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire(10).unwrap())
        };
        std::thread::sleep(Duration::from_millis(30));

        pool.release(20);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!small.is_finished());
        assert!(!big.is_finished());

        pool.release(80);
        big.join().unwrap();
        small.join().unwrap();
        assert_eq!(pool.available(), 0);
    }
}
