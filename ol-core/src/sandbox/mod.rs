// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Sandboxes: isolated execution units that serve lambda requests.
//!
//! A [`SandboxBackend`] produces raw sandboxes ([`RawSandbox`]); the
//! [`SandboxPool`] wraps each one in a [`Sandbox`] that serializes calls,
//! turns any failure into death, fans out lifecycle events and keeps the
//! parent/child tree.

mod client;
mod daemon;
mod evictor;
#[cfg(test)]
mod fake;
mod fork;
mod mem_pool;
mod pool;
mod safe;
mod sock;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Limits;
use crate::error::SandboxError;
use crate::puller::CodeDir;
use crate::types::{PackageName, RuntimeKind, SandboxId};

pub use client::{SandboxClient, MAX_SOCK_PATH};
pub use daemon::{DaemonBackend, DaemonKind};
pub use evictor::Evictor;
pub use mem_pool::{MemPool, MemReservation};
pub use pool::SandboxPool;
pub use safe::Sandbox;
pub use sock::SockBackend;

/// What a sandbox is for and how big it may get.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SandboxMeta {
    /// Packages whose `files/` dirs go on the import path.
    pub installs: Vec<PackageName>,
    /// Top-level modules imported before serving.
    pub imports: Vec<String>,
    pub mem_mb: u64,
    pub cpu_percent: u64,
    pub runtime_sec: u64,
}

impl SandboxMeta {
    /// Zero limits mean "use the worker default".
    pub fn fill_defaults(&mut self, limits: &Limits) {
        if self.mem_mb == 0 {
            self.mem_mb = limits.mem_mb;
        }
        if self.cpu_percent == 0 {
            self.cpu_percent = limits.cpu_percent;
        }
        if self.runtime_sec == 0 {
            self.runtime_sec = limits.runtime_sec;
        }
    }
}

impl fmt::Display for SandboxMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installs: Vec<&str> = self.installs.iter().map(PackageName::as_str).collect();
        write!(
            f,
            "<installs=[{}], imports=[{}], mem-limit-mb={}>",
            installs.join(","),
            self.imports.join(","),
            self.mem_mb
        )
    }
}

/// Everything a backend needs to build one sandbox.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Read-only code mounted at `/handler`; required for leaves.
    pub code: Option<Arc<CodeDir>>,
    /// Writable per-sandbox directory mounted at `/host`.
    pub scratch_dir: PathBuf,
    pub meta: SandboxMeta,
    pub runtime: RuntimeKind,
    /// Leaves serve requests; non-leaves are zygotes that serve forks.
    pub is_leaf: bool,
    /// Leave the scratch dir on disk after destroy (package installs).
    pub keep_scratch: bool,
}

/// What a parent needs to relocate a forked child into its sandbox.
#[derive(Debug, Clone)]
pub struct ForkTarget {
    pub id: SandboxId,
    pub root_dir: PathBuf,
    pub cgroup_procs: Option<PathBuf>,
}

/// Lifecycle notifications delivered to pool listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxEventKind {
    Create,
    Pause,
    Unpause,
    /// Emitted on the parent after a successful fork.
    Fork,
    /// Emitted on a live parent when one of its children is Dead.
    ChildExit,
    Destroy,
    DestroyIgnored,
}

#[derive(Debug, Clone)]
pub struct SandboxEvent {
    pub kind: SandboxEventKind,
    pub sandbox: Arc<Sandbox>,
}

/// Event callbacks run synchronously on the emitting thread and must not
/// block.
pub type SandboxListener = Box<dyn Fn(&SandboxEvent) + Send + Sync>;

/// Backend-specific half of a sandbox. Calls are serialized by the
/// [`Sandbox`] wrapper; an error from any call makes the sandbox Dead.
pub trait RawSandbox: Send {
    fn pause(&mut self) -> Result<(), SandboxError>;

    fn unpause(&mut self) -> Result<(), SandboxError>;

    /// Release every backend resource. Called exactly once, after all
    /// descendants are Dead.
    fn destroy(&mut self, reason: &str);

    /// Parent side of a fork: spawn a process from this zygote and move it
    /// into `target`.
    fn fork_into(&mut self, target: &ForkTarget) -> Result<(), SandboxError>;

    /// Unix-socket transport to the runtime inside.
    fn client(&self) -> &SandboxClient;

    /// MB currently charged against the memory pool.
    fn mem_limit_mb(&self) -> u64;

    fn mem_usage_mb(&self) -> Result<u64, SandboxError>;

    fn debug_string(&self) -> String;

    fn runtime_log(&self) -> String {
        String::new()
    }
}

/// Run a blocking sandbox call (create, pause, destroy, ...) on the
/// blocking thread pool.
pub async fn offload<T, F>(op: F) -> Result<T, SandboxError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SandboxError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| SandboxError::Backend {
            reason: format!("blocking sandbox task failed: {}", e),
        })?
}

/// Factory for raw sandboxes.
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Build a sandbox. With a `parent`, the backend must obtain the process
    /// through [`Sandbox::fork`] and fail with `ForkFailed` if that fails.
    fn create(
        &self,
        id: SandboxId,
        request: &CreateRequest,
        parent: Option<&Sandbox>,
    ) -> Result<Box<dyn RawSandbox>, SandboxError>;

    /// Tear down backend-wide state after every sandbox is gone.
    fn cleanup(&self);
}
