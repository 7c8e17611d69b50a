// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process sandbox backend for engine tests.
//!
//! Every mock sandbox is an axum server on `<scratch>/ol.sock` that answers
//! `/run/pip-install` like the admin lambda and echoes everything else
//! together with the handler's `f.py`.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::routing::any;
use axum::{Json, Router};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use ol_core::config::WorkerConfig;
use ol_core::error::SandboxError;
use ol_core::sandbox::{
    CreateRequest, ForkTarget, MemPool, RawSandbox, Sandbox, SandboxBackend, SandboxClient,
    SandboxPool,
};
use ol_core::types::SandboxId;
use ol_core::{ConfigLoader, FunctionManager};

#[derive(Debug, Default)]
pub struct Counters {
    pub creates: AtomicUsize,
    pub forks: AtomicUsize,
    pub fork_attempts: AtomicUsize,
    pub destroys: AtomicUsize,
    pub pip_installs: AtomicUsize,
    pub fail_forks: AtomicBool,
}

pub struct MockBackend {
    counters: Arc<Counters>,
    runtime: tokio::runtime::Handle,
}

impl MockBackend {
    /// Must be called inside a tokio runtime.
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            runtime: tokio::runtime::Handle::current(),
        }
    }
}

#[derive(Clone)]
struct MockState {
    id: SandboxId,
    code: Option<PathBuf>,
    counters: Arc<Counters>,
}

async fn run(
    State(state): State<MockState>,
    UrlPath(name): UrlPath<String>,
    body: Bytes,
) -> Json<serde_json::Value> {
    if name == "pip-install" {
        state.counters.pip_installs.fetch_add(1, Ordering::SeqCst);
        // widen the window for concurrent installers
        tokio::time::sleep(Duration::from_millis(100)).await;

        let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
        let pkg = request["pkg"].as_str().unwrap_or_default();
        let top = pkg
            .split(|c| matches!(c, '=' | '<' | '>' | '!' | '~' | '['))
            .next()
            .unwrap_or_default()
            .replace('-', "_");
        return Json(serde_json::json!({ "Deps": [], "TopLevel": [top] }));
    }

    let body = String::from_utf8_lossy(&body).into_owned();
    if body == "sleep" {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let code = state
        .code
        .as_ref()
        .and_then(|dir| std::fs::read_to_string(dir.join("f.py")).ok())
        .unwrap_or_default();

    Json(serde_json::json!({
        "sandbox": state.id.to_string(),
        "function": name,
        "code": code.trim(),
        "body": body,
    }))
}

struct MockSandbox {
    scratch: PathBuf,
    sock: PathBuf,
    keep_scratch: bool,
    mem_mb: u64,
    client: SandboxClient,
    server: tokio::task::JoinHandle<()>,
    counters: Arc<Counters>,
}

impl RawSandbox for MockSandbox {
    fn pause(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }

    fn unpause(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }

    fn destroy(&mut self, _reason: &str) {
        self.server.abort();
        self.client.close_idle();
        let _ = std::fs::remove_file(&self.sock);
        if !self.keep_scratch {
            let _ = std::fs::remove_dir_all(&self.scratch);
        }
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
    }

    fn fork_into(&mut self, _target: &ForkTarget) -> Result<(), SandboxError> {
        self.counters.fork_attempts.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_forks.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend {
                reason: "injected fork failure".to_string(),
            });
        }
        self.counters.forks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn client(&self) -> &SandboxClient {
        &self.client
    }

    fn mem_limit_mb(&self) -> u64 {
        self.mem_mb
    }

    fn mem_usage_mb(&self) -> Result<u64, SandboxError> {
        Ok(self.mem_mb / 2)
    }

    fn debug_string(&self) -> String {
        format!("MOCK {}\n", self.scratch.display())
    }
}

impl SandboxBackend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn create(
        &self,
        id: SandboxId,
        request: &CreateRequest,
        parent: Option<&Sandbox>,
    ) -> Result<Box<dyn RawSandbox>, SandboxError> {
        let io = |e: std::io::Error| SandboxError::Backend {
            reason: e.to_string(),
        };

        if let Some(parent) = parent {
            parent.fork(&ForkTarget {
                id,
                root_dir: request.scratch_dir.clone(),
                cgroup_procs: None,
            })?;
        }

        std::fs::create_dir_all(&request.scratch_dir).map_err(io)?;
        let sock = request.scratch_dir.join("ol.sock");
        let _ = std::fs::remove_file(&sock);

        let _entered = self.runtime.enter();
        let listener = std::os::unix::net::UnixListener::bind(&sock).map_err(io)?;
        listener.set_nonblocking(true).map_err(io)?;
        let listener = tokio::net::UnixListener::from_std(listener).map_err(io)?;

        let app = Router::new()
            .route("/run/{name}", any(run))
            .with_state(MockState {
                id,
                code: request.code.as_ref().map(|c| c.path().to_path_buf()),
                counters: Arc::clone(&self.counters),
            });
        let server = self.runtime.spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSandbox {
            scratch: request.scratch_dir.clone(),
            sock: sock.clone(),
            keep_scratch: request.keep_scratch,
            mem_mb: request.meta.mem_mb,
            client: SandboxClient::new(sock, Duration::from_secs(10))?,
            server,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn cleanup(&self) {}
}

/// Temp worker layout plus an engine on the mock backend.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: Arc<WorkerConfig>,
    pub counters: Arc<Counters>,
    pub manager: Arc<FunctionManager>,
}

impl Harness {
    /// `extra` is merged into the base config JSON.
    pub async fn start(extra: serde_json::Value) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let mut raw = serde_json::json!({
            "worker_dir": dir.path().join("worker"),
            "registry": dir.path().join("registry"),
            "registry_cache_ms": 0,
            "mem_pool_mb": 1000,
            "limits": { "mem_mb": 50, "installer_mem_mb": 50 },
            "features": { "import_cache": "off" },
        });
        merge(&mut raw, extra);

        let config = Arc::new(ConfigLoader::load_string(&raw.to_string()).unwrap());
        std::fs::create_dir_all(&config.worker_dir).unwrap();

        let counters = Arc::new(Counters::default());
        let pool = Arc::new(SandboxPool::new(
            Box::new(MockBackend::new(Arc::clone(&counters))),
            MemPool::new("sandboxes", config.mem_pool_mb, false),
            config.limits.clone(),
        ));
        pool.start_evictor(config.limits.mem_mb, false).unwrap();

        let manager = FunctionManager::with_pool(Arc::clone(&config), pool)
            .await
            .unwrap();

        Self {
            dir,
            config,
            counters,
            manager: Arc::new(manager),
        }
    }

    pub fn registry(&self) -> PathBuf {
        self.dir.path().join("registry")
    }

    /// Upload `<name>.tar.gz` holding `files`.
    pub fn publish(&self, name: &str, files: &[(&str, &str)]) {
        publish(&self.registry(), name, files);
    }

    pub async fn invoke(
        &self,
        name: &str,
        body: &str,
    ) -> ol_core::WorkerResult<serde_json::Value> {
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("/run/{}", name))
            .body(Bytes::from(body.to_string()))
            .unwrap();
        let response = self.manager.invoke(name, request).await?;
        Ok(serde_json::from_slice(response.body()).unwrap())
    }
}

pub fn publish(registry: &Path, name: &str, files: &[(&str, &str)]) {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    let bytes = builder.into_inner().unwrap().finish().unwrap();

    std::fs::create_dir_all(registry).unwrap();
    let tmp = registry.join(format!("{}.tar.gz.tmp", name));
    std::fs::File::create(&tmp)
        .unwrap()
        .write_all(&bytes)
        .unwrap();
    std::fs::rename(tmp, registry.join(format!("{}.tar.gz", name))).unwrap();
}

fn merge(base: &mut serde_json::Value, extra: serde_json::Value) {
    match (base, extra) {
        (serde_json::Value::Object(base), serde_json::Value::Object(extra)) => {
            for (key, value) in extra {
                merge(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, extra) => *base = extra,
    }
}
