// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Function manager: the engine's single entrypoint.
//!
//! Owns every shared component (sandbox pool, code puller, package
//! installer, zygotes, dependency tracer, metrics) and the map from
//! function name to [`LambdaFunc`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::blob::{self, BlobStore};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::MetricsRegistry;
use crate::packages::{DepTracer, PackageInstaller};
use crate::puller::CodePuller;
use crate::sandbox::SandboxPool;
use crate::storage::{DirMaker, StoreMode};
use crate::types::FunctionName;
use crate::zygote::ZygoteProvider;

use super::function::{FunctionStats, LambdaFunc};

/// Components shared by every function.
pub(crate) struct Shared {
    pub(crate) config: Arc<WorkerConfig>,
    pub(crate) pool: Arc<SandboxPool>,
    pub(crate) puller: Arc<CodePuller>,
    pub(crate) installer: Arc<PackageInstaller>,
    pub(crate) zygotes: Option<ZygoteProvider>,
    pub(crate) tracer: Option<Arc<DepTracer>>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) scratch: DirMaker,
}

pub struct FunctionManager {
    shared: Arc<Shared>,
    functions: Mutex<HashMap<FunctionName, Arc<LambdaFunc>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FunctionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionManager")
            .field("worker_dir", &self.shared.config.worker_dir)
            .field("functions", &self.functions.lock().len())
            .finish()
    }
}

impl FunctionManager {
    /// Build the engine described by `config`, including the configured
    /// sandbox backend.
    pub async fn new(config: Arc<WorkerConfig>) -> WorkerResult<Self> {
        let cfg = Arc::clone(&config);
        let pool = tokio::task::spawn_blocking(move || SandboxPool::from_config(&cfg))
            .await
            .map_err(|e| WorkerError::Syscall {
                syscall: "spawn_blocking",
                message: e.to_string(),
            })??;
        Self::with_pool(config, Arc::new(pool)).await
    }

    /// Build the engine on an existing sandbox pool.
    pub async fn with_pool(config: Arc<WorkerConfig>, pool: Arc<SandboxPool>) -> WorkerResult<Self> {
        let metrics = MetricsRegistry::new_shared(config.trace.latency);
        let store = blob::open(&config.registry)?;
        let puller = Arc::new(CodePuller::new(store, config.worker_dir.join("code"))?);
        let scratch = DirMaker::new(config.worker_dir.join("scratch"), StoreMode::Regular)?;

        let tracer = Arc::new(DepTracer::open(config.worker_dir.join("dep-trace.json")).await?);
        let installer = Arc::new(PackageInstaller::new(
            &config,
            Arc::clone(&pool),
            Some(Arc::clone(&tracer)),
            Arc::clone(&metrics),
        )?);

        let zygotes = ZygoteProvider::from_config(
            &config,
            Arc::clone(&pool),
            Arc::clone(&installer),
            Arc::clone(&metrics),
        )
        .await?;

        tracing::info!(
            worker_dir = %config.worker_dir.display(),
            registry = %config.registry,
            import_cache = ?config.features.import_cache,
            "Function manager ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                pool,
                puller,
                installer,
                zygotes,
                tracer: Some(tracer),
                metrics,
                scratch,
            }),
            functions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<WorkerConfig> {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.shared.metrics
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.shared.pool
    }

    pub fn installer(&self) -> &Arc<PackageInstaller> {
        &self.shared.installer
    }

    /// Registry the code is pulled from.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        self.shared.puller.store()
    }

    /// Look up or create the function named `name`.
    pub fn function(&self, name: &FunctionName) -> Arc<LambdaFunc> {
        let mut functions = self.functions.lock();
        Arc::clone(functions.entry(name.clone()).or_insert_with(|| {
            tracing::debug!(function = %name, "Creating function");
            Arc::new(LambdaFunc::new(name.clone(), Arc::clone(&self.shared)))
        }))
    }

    /// Run `request` on the function named `name`.
    pub async fn invoke(
        &self,
        name: &str,
        request: http::Request<Bytes>,
    ) -> WorkerResult<http::Response<Bytes>> {
        let name = FunctionName::new(name)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::FunctionDying(name));
        }
        let timer = self.shared.metrics.t0("invoke");
        let function = self.function(&name);
        let result = function.invoke(request).await;
        timer.t1();

        if let Err(e) = &result {
            self.shared.metrics.inc("invoke.error");
            tracing::debug!(function = %name, error = %e, "Invocation failed");
        }
        result
    }

    /// Kill one function; returns whether it existed.
    ///
    /// The dying function stays in the map until it has drained, so
    /// requests arriving meanwhile are refused instead of starting a
    /// second copy next to it.
    pub async fn kill(&self, name: &FunctionName) -> bool {
        let Some(function) = self.functions.lock().get(name).cloned() else {
            return false;
        };
        function.kill().await;

        let mut functions = self.functions.lock();
        if functions
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &function))
        {
            functions.remove(name);
        }
        true
    }

    pub fn function_stats(&self) -> Vec<FunctionStats> {
        let mut functions: Vec<Arc<LambdaFunc>> = self.functions.lock().values().cloned().collect();
        functions.sort_by(|a, b| a.name().cmp(b.name()));
        functions.iter().map(|f| f.stats()).collect()
    }

    /// Metrics snapshot plus per-function load figures.
    pub fn stats(&self) -> BTreeMap<String, u64> {
        let mut stats = self.shared.metrics.snapshot();
        for f in self.function_stats() {
            stats.insert(format!("lambda.{}.desired-instances", f.name), f.desired_instances);
            stats.insert(format!("lambda.{}.idle", f.name), f.idle as u64);
            stats.insert(format!("lambda.{}.in-flight", f.name), f.in_flight as u64);
        }
        let mem = self.shared.pool.mem();
        stats.insert("mem-pool.available-mb".to_string(), mem.available());
        stats.insert("mem-pool.total-mb".to_string(), mem.total());
        stats
    }

    /// Sandbox pool dump, followed by the zygote tree.
    pub fn debug_string(&self) -> String {
        let mut out = self.shared.pool.debug_string();
        if let Some(zygotes) = &self.shared.zygotes {
            out += "======== import cache ========\n";
            out += &zygotes.dump();
        }
        out
    }

    /// Shut the engine down: refuse new requests, destroy every sandbox
    /// (in-flight requests fail with the sandbox's "shutdown" death), then
    /// tear down functions, zygotes and the tracer, and write `stats.json`.
    pub async fn cleanup(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let functions: Vec<Arc<LambdaFunc>> = self.functions.lock().drain().map(|(_, f)| f).collect();
        for function in &functions {
            function.stop();
        }

        let pool = Arc::clone(&self.shared.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.cleanup()).await {
            tracing::error!(error = %e, "Sandbox pool cleanup panicked");
        }

        for function in functions {
            function.kill().await;
        }

        if let Some(zygotes) = &self.shared.zygotes {
            zygotes.cleanup().await;
        }
        if let Some(tracer) = &self.shared.tracer {
            tracer.cleanup().await;
        }

        let stats_path = self.shared.config.worker_dir.join("stats.json");
        if let Err(e) = self.shared.metrics.dump(&stats_path) {
            tracing::warn!(path = %stats_path.display(), error = %e, "Could not write stats");
        }
        tracing::info!("Function manager stopped");
    }
}
