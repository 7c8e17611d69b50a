// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Thread-safe sandbox handle.
//!
//! Wraps a [`RawSandbox`] and guarantees:
//! - calls are serialized by a per-sandbox mutex;
//! - any failing operation destroys the sandbox, and later calls return
//!   `SandboxError::Dead` without touching the backend;
//! - Pause on a paused sandbox and Unpause on a running one are no-ops;
//! - a parent with live children lingers in `Dying` and is torn down when
//!   its last child exits, so lifetimes nest.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::SandboxError;
use crate::puller::CodeDir;
use crate::state::{SandboxState, SandboxStateMachine};
use crate::types::{RuntimeKind, SandboxId};

use super::mem_pool::MemReservation;
use super::pool::PoolShared;
use super::{
    ForkTarget, RawSandbox, SandboxClient, SandboxEvent, SandboxEventKind, SandboxMeta,
};

struct Inner {
    raw: Box<dyn RawSandbox>,
    state: SandboxStateMachine,
    dead_reason: Option<String>,
    reservation: Option<MemReservation>,
    code: Option<Arc<CodeDir>>,
}

pub struct Sandbox {
    id: SandboxId,
    meta: SandboxMeta,
    runtime: RuntimeKind,
    is_leaf: bool,
    parent: Option<Arc<Sandbox>>,
    shared: Arc<PoolShared>,
    me: Weak<Sandbox>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("is_leaf", &self.is_leaf)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

pub(super) struct SandboxParts {
    pub id: SandboxId,
    pub meta: SandboxMeta,
    pub runtime: RuntimeKind,
    pub is_leaf: bool,
    pub code: Option<Arc<CodeDir>>,
    pub raw: Box<dyn RawSandbox>,
    pub reservation: MemReservation,
    pub parent: Option<Arc<Sandbox>>,
}

impl Sandbox {
    pub(super) fn new(parts: SandboxParts, shared: Arc<PoolShared>) -> Arc<Self> {
        let mut state = SandboxStateMachine::new(parts.id);
        // backend create returned, so the runtime is up
        let _ = state.transition_to(SandboxState::Running);

        Arc::new_cyclic(|me| Self {
            id: parts.id,
            meta: parts.meta,
            runtime: parts.runtime,
            is_leaf: parts.is_leaf,
            parent: parts.parent,
            shared,
            me: me.clone(),
            inner: Mutex::new(Inner {
                raw: parts.raw,
                state,
                dead_reason: None,
                reservation: Some(parts.reservation),
                code: parts.code,
            }),
        })
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn meta(&self) -> &SandboxMeta {
        &self.meta
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn parent(&self) -> Option<&Arc<Sandbox>> {
        self.parent.as_ref()
    }

    pub fn state(&self) -> SandboxState {
        self.inner.lock().state.state()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == SandboxState::Paused
    }

    /// Dying or Dead.
    pub fn is_dead(&self) -> bool {
        self.inner.lock().dead_reason.is_some()
    }

    /// The error later callers will see, if this sandbox is gone.
    pub fn dead_error(&self) -> Option<SandboxError> {
        let inner = self.inner.lock();
        inner.dead_reason.as_ref().map(|reason| self.dead(reason))
    }

    fn dead(&self, reason: &str) -> SandboxError {
        SandboxError::Dead {
            id: self.id,
            reason: reason.to_string(),
        }
    }

    fn emit(&self, kind: SandboxEventKind) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let event = SandboxEvent { kind, sandbox: me };
        for listener in self.shared.listeners.read().iter() {
            listener(&event);
        }
    }

    pub(super) fn announce(&self) {
        let _guard = self.inner.lock();
        self.emit(SandboxEventKind::Create);
    }

    /// Transport to the runtime. Fails once the sandbox is Dying or Dead.
    pub fn client(&self) -> Result<SandboxClient, SandboxError> {
        let inner = self.inner.lock();
        if let Some(reason) = &inner.dead_reason {
            return Err(self.dead(reason));
        }
        Ok(inner.raw.client().clone())
    }

    pub fn pause(&self) -> Result<(), SandboxError> {
        let result = {
            let mut inner = self.inner.lock();
            if let Some(reason) = &inner.dead_reason {
                return Err(self.dead(reason));
            }
            if inner.state.state() == SandboxState::Paused {
                return Ok(());
            }

            match inner.raw.pause() {
                Ok(()) => {
                    inner.raw.client().close_idle();
                    if let Err(e) = inner.state.transition_to(SandboxState::Paused) {
                        tracing::warn!(sandbox = %self.id, error = %e, "Unexpected pause");
                    }
                    self.emit(SandboxEventKind::Pause);
                    Ok(())
                }
                Err(e) => {
                    let finalized = self.kill_locked(&mut inner, &format!("pause failed: {}", e));
                    Err((e, finalized))
                }
            }
        };
        self.after_failure(result)
    }

    pub fn unpause(&self) -> Result<(), SandboxError> {
        let result = {
            let mut inner = self.inner.lock();
            if let Some(reason) = &inner.dead_reason {
                return Err(self.dead(reason));
            }
            if inner.state.state() != SandboxState::Paused {
                return Ok(());
            }

            // announced before the op so watchers never underestimate activity
            self.emit(SandboxEventKind::Unpause);
            match inner.raw.unpause() {
                Ok(()) => {
                    if let Err(e) = inner.state.transition_to(SandboxState::Running) {
                        tracing::warn!(sandbox = %self.id, error = %e, "Unexpected unpause");
                    }
                    Ok(())
                }
                Err(e) => {
                    let finalized =
                        self.kill_locked(&mut inner, &format!("unpause failed: {}", e));
                    Err((e, finalized))
                }
            }
        };
        self.after_failure(result)
    }

    fn after_failure(
        &self,
        result: Result<(), (SandboxError, bool)>,
    ) -> Result<(), SandboxError> {
        match result {
            Ok(()) => Ok(()),
            Err((e, finalized)) => {
                tracing::warn!(sandbox = %self.id, error = %e, "Destroyed after failure");
                if finalized {
                    self.notify_parent();
                }
                Err(e)
            }
        }
    }

    pub fn destroy(&self, reason: &str) {
        let finalized = {
            let mut inner = self.inner.lock();
            if inner.dead_reason.is_some() {
                return;
            }
            self.kill_locked(&mut inner, reason)
        };
        if finalized {
            self.notify_parent();
        }
    }

    /// Destroy only if currently paused; otherwise emit `DestroyIgnored`.
    pub fn destroy_if_paused(&self, reason: &str) {
        let finalized = {
            let mut inner = self.inner.lock();
            if inner.dead_reason.is_some() {
                return;
            }
            if inner.state.state() != SandboxState::Paused {
                self.emit(SandboxEventKind::DestroyIgnored);
                return;
            }
            self.kill_locked(&mut inner, reason)
        };
        if finalized {
            self.notify_parent();
        }
    }

    /// Mark dead; tear down now, or defer to the last child's exit.
    /// Returns whether the backend was destroyed.
    fn kill_locked(&self, inner: &mut Inner, reason: &str) -> bool {
        tracing::debug!(sandbox = %self.id, reason, "Destroy");
        inner.dead_reason = Some(reason.to_string());

        if self.shared.has_children(self.id) {
            if inner.state.state() == SandboxState::Running {
                if let Err(e) = inner.raw.pause() {
                    tracing::warn!(sandbox = %self.id, error = %e, "Could not quiesce dying sandbox");
                }
            }
            if let Err(e) = inner.state.transition_to(SandboxState::Dying) {
                tracing::warn!(sandbox = %self.id, error = %e, "Unexpected destroy");
            }
            self.emit(SandboxEventKind::Destroy);
            return false;
        }

        self.finalize(inner, reason);
        self.emit(SandboxEventKind::Destroy);
        true
    }

    fn finalize(&self, inner: &mut Inner, reason: &str) {
        inner.raw.destroy(reason);

        if let Some(mut reservation) = inner.reservation.take() {
            reservation.set_mb(inner.raw.mem_limit_mb());
        }
        inner.code = None;

        if let Err(e) = inner.state.transition_to(SandboxState::Dead) {
            tracing::warn!(sandbox = %self.id, error = %e, "Unexpected finalize");
        }
        self.shared.live.remove(&self.id);
    }

    fn notify_parent(&self) {
        if let Some(parent) = &self.parent {
            parent.child_exit(self.id);
        }
    }

    /// Fork a child process from this zygote into `target`.
    ///
    /// Called by backends while building a child. A failed fork leaves the
    /// parent alive.
    pub fn fork(&self, target: &ForkTarget) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.dead_reason {
            return Err(SandboxError::ForkFailed {
                parent: self.id,
                reason: format!("parent is dead: {}", reason),
            });
        }

        self.shared.add_child(self.id, target.id);
        if let Err(e) = inner.raw.fork_into(target) {
            self.shared.remove_child(self.id, target.id);
            return Err(match e {
                SandboxError::ForkFailed { .. } => e,
                other => SandboxError::ForkFailed {
                    parent: self.id,
                    reason: other.to_string(),
                },
            });
        }

        self.emit(SandboxEventKind::Fork);
        Ok(())
    }

    pub(super) fn child_exit(&self, child: SandboxId) {
        if !self.shared.remove_child(self.id, child) {
            return;
        }

        let finalized = {
            let mut inner = self.inner.lock();
            match inner.state.state() {
                SandboxState::Dying => {
                    if self.shared.has_children(self.id) {
                        false
                    } else {
                        let reason = inner.dead_reason.clone().unwrap_or_default();
                        self.finalize(&mut inner, &reason);
                        true
                    }
                }
                SandboxState::Dead => false,
                _ => {
                    self.emit(SandboxEventKind::ChildExit);
                    false
                }
            }
        };

        if finalized {
            self.notify_parent();
        }
    }

    pub fn mem_usage_mb(&self) -> Result<u64, SandboxError> {
        let inner = self.inner.lock();
        if let Some(reason) = &inner.dead_reason {
            return Err(self.dead(reason));
        }
        inner.raw.mem_usage_mb()
    }

    pub fn runtime_log(&self) -> String {
        self.inner.lock().raw.runtime_log()
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock();
        if let Some(reason) = &inner.dead_reason {
            return format!("SANDBOX {} is DEAD: {}\n", self.id, reason);
        }

        let mut s = format!(
            "SANDBOX {} [{} {}s] {} leaf={} parent={}\n",
            self.id,
            inner.state.state(),
            inner.state.time_in_current_state().as_secs(),
            self.meta,
            self.is_leaf,
            self.parent
                .as_ref()
                .map(|p| p.id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        s += &inner.raw.debug_string();
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::sandbox::fake::{count, fake_pool, record_events, request};

    #[test]
    fn test_failed_pause_destroys() {
        let (pool, log) = fake_pool(100);
        let sb = pool.create(&request(20, true), None).unwrap();
        assert_eq!(pool.mem().available(), 80);

        log.fail_pause.store(true, Ordering::SeqCst);
        assert!(matches!(sb.pause(), Err(SandboxError::Backend { .. })));
        assert_eq!(sb.state(), SandboxState::Dead);
        assert_eq!(log.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(pool.mem().available(), 100);
        assert!(pool.live().is_empty());

        // later calls never reach the backend
        log.fail_pause.store(false, Ordering::SeqCst);
        assert!(matches!(sb.pause(), Err(SandboxError::Dead { .. })));
        assert!(matches!(sb.unpause(), Err(SandboxError::Dead { .. })));
        assert!(matches!(sb.client(), Err(SandboxError::Dead { .. })));
        assert_eq!(log.pauses.load(Ordering::SeqCst), 0);
        assert!(sb.debug_string().contains("DEAD: pause failed"));
    }

    #[test]
    fn test_failed_unpause_destroys() {
        let (pool, log) = fake_pool(100);
        let sb = pool.create(&request(20, true), None).unwrap();
        sb.pause().unwrap();

        log.fail_unpause.store(true, Ordering::SeqCst);
        assert!(sb.unpause().is_err());
        assert_eq!(sb.state(), SandboxState::Dead);
        assert!(matches!(sb.dead_error(), Some(SandboxError::Dead { .. })));
        assert!(matches!(sb.pause(), Err(SandboxError::Dead { .. })));
        assert_eq!(log.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(pool.mem().available(), 100);
    }

    #[test]
    fn test_destroy_twice_tears_down_once() {
        let (pool, log) = fake_pool(100);
        let events = record_events(&pool);
        let sb = pool.create(&request(20, true), None).unwrap();

        sb.destroy("first");
        sb.destroy("second");
        sb.destroy_if_paused("third");

        assert_eq!(log.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(count(&events, SandboxEventKind::Destroy, sb.id()), 1);
        assert_eq!(pool.mem().available(), 100);
        assert!(sb.debug_string().contains("DEAD: first"));
    }

    #[test]
    fn test_pause_unpause_idempotent() {
        let (pool, log) = fake_pool(100);
        let events = record_events(&pool);
        let sb = pool.create(&request(20, true), None).unwrap();

        sb.unpause().unwrap();
        assert_eq!(log.unpauses.load(Ordering::SeqCst), 0);
        assert_eq!(count(&events, SandboxEventKind::Unpause, sb.id()), 0);

        sb.pause().unwrap();
        sb.pause().unwrap();
        assert!(sb.is_paused());
        assert_eq!(log.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(count(&events, SandboxEventKind::Pause, sb.id()), 1);

        sb.unpause().unwrap();
        sb.unpause().unwrap();
        assert_eq!(sb.state(), SandboxState::Running);
        assert_eq!(log.unpauses.load(Ordering::SeqCst), 1);
        assert_eq!(count(&events, SandboxEventKind::Unpause, sb.id()), 1);
    }

    #[test]
    fn test_parent_lingers_until_last_child_exits() {
        let (pool, log) = fake_pool(100);
        let events = record_events(&pool);
        let parent = pool.create(&request(20, false), None).unwrap();
        let first = pool.create(&request(10, true), Some(&parent)).unwrap();
        let second = pool.create(&request(10, true), Some(&parent)).unwrap();
        assert_eq!(count(&events, SandboxEventKind::Fork, parent.id()), 2);
        assert_eq!(pool.mem().available(), 60);

        parent.destroy("zygote retired");
        assert_eq!(parent.state(), SandboxState::Dying);
        assert!(parent.is_dead());
        assert!(matches!(parent.client(), Err(SandboxError::Dead { .. })));
        assert_eq!(log.destroys.load(Ordering::SeqCst), 0);
        assert_eq!(pool.live().len(), 3);

        first.destroy("done");
        assert_eq!(parent.state(), SandboxState::Dying);
        assert_eq!(log.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(pool.mem().available(), 70);

        second.destroy("done");
        assert_eq!(parent.state(), SandboxState::Dead);
        assert_eq!(log.destroys.load(Ordering::SeqCst), 3);
        assert_eq!(pool.mem().available(), 100);
        assert!(pool.live().is_empty());
        assert_eq!(count(&events, SandboxEventKind::Destroy, parent.id()), 1);
    }

    #[test]
    fn test_child_exit_on_live_parent() {
        let (pool, _log) = fake_pool(100);
        let events = record_events(&pool);
        let parent = pool.create(&request(20, false), None).unwrap();
        let child = pool.create(&request(10, true), Some(&parent)).unwrap();

        child.destroy("done");
        assert_eq!(count(&events, SandboxEventKind::ChildExit, parent.id()), 1);
        assert_eq!(parent.state(), SandboxState::Running);

        // no children left, so the parent goes straight to Dead
        parent.destroy("done");
        assert_eq!(parent.state(), SandboxState::Dead);
        assert_eq!(pool.mem().available(), 100);
    }

    #[test]
    fn test_destroy_if_paused_ignores_running() {
        let (pool, log) = fake_pool(100);
        let events = record_events(&pool);
        let sb = pool.create(&request(20, true), None).unwrap();

        sb.destroy_if_paused("idle eviction");
        assert_eq!(count(&events, SandboxEventKind::DestroyIgnored, sb.id()), 1);
        assert_eq!(sb.state(), SandboxState::Running);
        assert!(sb.client().is_ok());
        assert_eq!(log.destroys.load(Ordering::SeqCst), 0);

        sb.pause().unwrap();
        sb.destroy_if_paused("idle eviction");
        assert_eq!(sb.state(), SandboxState::Dead);
        assert_eq!(log.destroys.load(Ordering::SeqCst), 1);
    }
}
