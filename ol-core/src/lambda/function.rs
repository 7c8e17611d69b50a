// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One lambda function: its current code, parsed requirements and the MRU
//! list of paused sandboxes running that code.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::{PullError, SandboxError, WorkerError, WorkerResult};
use crate::lambda_config::LambdaConfig;
use crate::puller::CodeDir;
use crate::sandbox::{offload, CreateRequest, Sandbox, SandboxMeta};
use crate::types::{FunctionName, PackageName, RuntimeKind};

use super::autoscaler::Autoscaler;
use super::manager::Shared;

struct FuncState {
    code: Option<Arc<CodeDir>>,
    config: LambdaConfig,
    meta: SandboxMeta,
    /// Bumped whenever new code is accepted.
    version: u64,
    last_pull: Option<Instant>,
    /// Paused sandboxes running `version`; most recently used first.
    idle: VecDeque<Arc<Sandbox>>,
}

/// Point-in-time view for stats and debugging.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionStats {
    pub name: String,
    pub version: u64,
    pub idle: usize,
    pub in_flight: usize,
    pub exec_ms_avg: u64,
    pub desired_instances: u64,
}

pub struct LambdaFunc {
    name: FunctionName,
    shared: Arc<Shared>,
    state: tokio::sync::Mutex<FuncState>,
    in_flight: AtomicUsize,
    drained: Notify,
    dying: AtomicBool,
    scaler: Mutex<Autoscaler>,
    /// Mirrors of `FuncState` for lock-free stats.
    version: AtomicU64,
    idle: AtomicUsize,
}

impl std::fmt::Debug for LambdaFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaFunc")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counts one admitted invocation; wakes [`LambdaFunc::kill`] when the last
/// one leaves.
struct InFlight(Arc<LambdaFunc>);

impl InFlight {
    /// Returns the slot and how many invocations were already admitted.
    fn admit(func: &Arc<LambdaFunc>) -> (Self, usize) {
        let queued = func.in_flight.fetch_add(1, Ordering::SeqCst);
        (Self(Arc::clone(func)), queued)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Parse `requirements.txt` as produced by pip-compile: spaces removed,
/// `#` comments and `;` environment markers dropped, names normalized.
/// A missing file means no requirements.
pub fn parse_requirements(code_dir: &Path) -> Result<Vec<PackageName>, PullError> {
    let path = code_dir.join("requirements.txt");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PullError::Io {
                context: "reading requirements.txt",
                source: e,
            })
        }
    };

    Ok(text
        .lines()
        .filter_map(|line| {
            let line = line.replace(' ', "");
            let spec = line.split('#').next().unwrap_or("");
            let spec = spec.split(';').next().unwrap_or("");
            (!spec.is_empty()).then(|| PackageName::normalize(spec))
        })
        .collect())
}

impl LambdaFunc {
    pub(super) fn new(name: FunctionName, shared: Arc<Shared>) -> Self {
        Self {
            name,
            shared,
            state: tokio::sync::Mutex::new(FuncState {
                code: None,
                config: LambdaConfig::default(),
                meta: SandboxMeta::default(),
                version: 0,
                last_pull: None,
                idle: VecDeque::new(),
            }),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            dying: AtomicBool::new(false),
            scaler: Mutex::new(Autoscaler::new()),
            version: AtomicU64::new(0),
            idle: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &FunctionName {
        &self.name
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    /// Serve one request on a sandbox running the current code.
    ///
    /// Runs on its own task: if the caller is dropped mid-request, the task
    /// still returns the sandbox to the idle list or destroys it.
    pub async fn invoke(
        self: &Arc<Self>,
        request: http::Request<Bytes>,
    ) -> WorkerResult<http::Response<Bytes>> {
        if self.is_dying() {
            return Err(WorkerError::FunctionDying(self.name.clone()));
        }

        let (slot, queued) = InFlight::admit(self);
        if queued >= self.shared.config.queue_depth {
            self.shared.metrics.inc("lambda.queue-full");
            return Err(WorkerError::TooManyRequests {
                function: self.name.clone(),
            });
        }

        let func = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _slot = slot;
            func.serve(request).await
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(SandboxError::Backend {
                reason: format!("invocation task failed: {}", e),
            }
            .into()),
        }
    }

    async fn serve(&self, request: http::Request<Bytes>) -> WorkerResult<http::Response<Bytes>> {
        let (sandbox, version, code) = {
            let mut state = self.state.lock().await;
            self.check_for_updates(&mut state).await?;

            let method = request.method().as_str();
            if !state.config.is_http_method_allowed(method) {
                return Err(WorkerError::MethodNotAllowed {
                    function: self.name.clone(),
                    method: method.to_string(),
                    allowed: state.config.allowed_http_methods(),
                });
            }

            let sandbox = self.get_unpaused_sandbox(&mut state).await?;
            (sandbox, state.version, state.code.clone())
        };

        if let (Some(tracer), Some(code)) = (&self.shared.tracer, &code) {
            tracer.trace_invocation(code.path()).await;
        }

        self.scaler.lock().started(Instant::now());
        let started = Instant::now();
        let result = match sandbox.client() {
            Ok(client) => client.send(request).await,
            Err(e) => Err(e),
        };
        let exec_ms = started.elapsed().as_millis() as u64;
        self.scaler.lock().finished(exec_ms, Instant::now());
        self.shared.metrics.record_ms("lambda.invoke", exec_ms);

        let result = result.map_err(|e| {
            // a sandbox destroyed mid-request reports why
            sandbox.dead_error().unwrap_or(e)
        });

        self.return_sandbox(sandbox, version, result.is_ok()).await;
        result.map_err(WorkerError::from)
    }

    /// Put a sandbox back on the idle list, or destroy it if it is stale,
    /// broken or the function is going away.
    async fn return_sandbox(&self, sandbox: Arc<Sandbox>, version: u64, healthy: bool) {
        let mut state = self.state.lock().await;

        let reason = if !healthy {
            Some("request failed")
        } else if self.is_dying() {
            Some("function killed")
        } else if version != state.version {
            Some("code version outdated")
        } else {
            None
        };

        if let Some(reason) = reason {
            drop(state);
            destroy(sandbox, reason).await;
            return;
        }

        let sb = Arc::clone(&sandbox);
        match offload(move || sb.pause()).await {
            Ok(()) => {
                state.idle.retain(|idle| !idle.is_dead());
                state.idle.push_front(sandbox);
                self.idle.store(state.idle.len(), Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(function = %self.name, sandbox = %sandbox.id(), error = %e, "Pause failed; sandbox dropped");
            }
        }
    }

    /// Pull new code if the cache window has passed; on a new artifact,
    /// install its requirements, then retire the old version's sandboxes.
    ///
    /// On failure the old code stays current and the next call retries.
    async fn check_for_updates(&self, state: &mut FuncState) -> WorkerResult<()> {
        let cache_window = Duration::from_millis(self.shared.config.registry_cache_ms);
        if let Some(last) = state.last_pull {
            if last.elapsed() < cache_window {
                return Ok(());
            }
        }

        let puller = Arc::clone(&self.shared.puller);
        let name = self.name.clone();
        let code = tokio::task::spawn_blocking(move || puller.pull(&name))
            .await
            .map_err(|e| SandboxError::Backend {
                reason: format!("code pull task failed: {}", e),
            })??;

        if state
            .code
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &code))
        {
            state.last_pull = Some(Instant::now());
            return Ok(());
        }

        let (config, meta, direct) = match self.prepare(&code).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(function = %self.name, error = %e, "Rejecting new code");
                // the dir may be dirty, so download fresh next time
                self.shared.puller.reset(&self.name);
                return Err(e);
            }
        };

        state.version += 1;
        self.version.store(state.version, Ordering::Relaxed);
        tracing::info!(
            function = %self.name,
            version = state.version,
            code = %code.path().display(),
            runtime = %code.runtime(),
            "Loaded new code"
        );

        let stale: Vec<Arc<Sandbox>> = state.idle.drain(..).collect();
        self.idle.store(0, Ordering::Relaxed);
        for sandbox in stale {
            destroy(sandbox, "code version outdated").await;
        }

        if let Some(tracer) = &self.shared.tracer {
            tracer.trace_function(code.path(), &direct).await;
        }

        state.code = Some(code);
        state.config = config;
        state.meta = meta;
        state.last_pull = Some(Instant::now());
        Ok(())
    }

    async fn prepare(
        &self,
        code: &Arc<CodeDir>,
    ) -> WorkerResult<(LambdaConfig, SandboxMeta, Vec<PackageName>)> {
        let config = LambdaConfig::load(code.path())?;

        let mut meta = SandboxMeta {
            mem_mb: config.limits.mem_mb.unwrap_or(0),
            cpu_percent: config.limits.cpu_percent.unwrap_or(0),
            runtime_sec: config.limits.runtime_sec.unwrap_or(0),
            ..Default::default()
        };

        let mut direct = Vec::new();
        if code.runtime() == RuntimeKind::Python {
            direct = parse_requirements(code.path())?;
            meta.installs = self.shared.installer.install_recursive(&direct).await?;
        }
        Ok((config, meta, direct))
    }

    /// MRU idle sandbox, else a fork from the zygote tree, else a fresh one.
    async fn get_unpaused_sandbox(&self, state: &mut FuncState) -> WorkerResult<Arc<Sandbox>> {
        while let Some(sandbox) = state.idle.pop_front() {
            self.idle.store(state.idle.len(), Ordering::Relaxed);
            let sb = Arc::clone(&sandbox);
            match offload(move || sb.unpause()).await {
                Ok(()) => {
                    self.shared.metrics.inc("sandbox.reuse");
                    return Ok(sandbox);
                }
                Err(e) => {
                    tracing::debug!(function = %self.name, sandbox = %sandbox.id(), error = %e, "Discarding idle sandbox");
                }
            }
        }

        let Some(code) = state.code.clone() else {
            return Err(WorkerError::Pull(PullError::LambdaMissing {
                name: self.name.to_string(),
            }));
        };
        let request = CreateRequest {
            runtime: code.runtime(),
            code: Some(code),
            scratch_dir: self.shared.scratch.get(self.name.as_str()),
            meta: state.meta.clone(),
            is_leaf: true,
            keep_scratch: false,
        };

        if let Some(zygotes) = self.shared.zygotes.as_ref() {
            if request.runtime == RuntimeKind::Python {
                match zygotes.create(&request).await {
                    Ok(sandbox) => {
                        self.shared.metrics.inc("sandbox.create.zygote");
                        return Ok(sandbox);
                    }
                    Err(original) => {
                        self.shared.metrics.inc("sandbox.create.fallback");
                        tracing::warn!(function = %self.name, error = %original, "Zygote create failed; creating without parent");
                        return match self.create_fresh(request).await {
                            Ok(sandbox) => Ok(sandbox),
                            Err(fallback) => {
                                tracing::warn!(function = %self.name, error = %fallback, "Fallback create failed too");
                                Err(original)
                            }
                        };
                    }
                }
            }
        }

        self.create_fresh(request).await
    }

    async fn create_fresh(&self, request: CreateRequest) -> WorkerResult<Arc<Sandbox>> {
        let pool = Arc::clone(&self.shared.pool);
        let sandbox = offload(move || pool.create(&request, None)).await?;
        self.shared.metrics.inc("sandbox.create.fresh");
        Ok(sandbox)
    }

    /// Refuse new requests; in-flight ones carry on.
    pub fn stop(&self) {
        self.dying.store(true, Ordering::SeqCst);
    }

    /// Stop admitting requests, wait for in-flight ones, then destroy
    /// every idle sandbox.
    pub async fn kill(&self) {
        self.stop();

        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }

        let mut state = self.state.lock().await;
        let idle: Vec<Arc<Sandbox>> = state.idle.drain(..).collect();
        self.idle.store(0, Ordering::Relaxed);
        for sandbox in idle {
            destroy(sandbox, "function killed").await;
        }
        state.code = None;
        tracing::debug!(function = %self.name, "Function killed");
    }

    pub fn stats(&self) -> FunctionStats {
        let scaler = self.scaler.lock().clone();
        FunctionStats {
            name: self.name.to_string(),
            version: self.version.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            exec_ms_avg: scaler.exec_ms_avg(),
            desired_instances: scaler.instances(),
        }
    }
}

async fn destroy(sandbox: Arc<Sandbox>, reason: &'static str) {
    let result = offload(move || {
        sandbox.destroy(reason);
        Ok(())
    })
    .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "Sandbox destroy task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_requirements() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "# via pip-compile\nRequests == 2.31.0\n\ntyping_extensions  # via pydantic\npywin32; sys_platform == 'win32'\n",
        )
        .unwrap();

        let pkgs = parse_requirements(dir.path()).unwrap();
        let names: Vec<&str> = pkgs.iter().map(PackageName::as_str).collect();
        assert_eq!(names, vec!["requests==2.31.0", "typing-extensions", "pywin32"]);
    }

    #[test]
    fn test_missing_requirements_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(parse_requirements(dir.path()).unwrap().is_empty());
    }
}
