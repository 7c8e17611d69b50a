// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Package installer.
//!
//! Each package is installed once into `<pkgs_dir>/<name>/files` by the
//! pip-install admin lambda, running in a short-lived non-zygote sandbox.
//! Concurrent requests for the same package wait for the first installer;
//! a failed install wipes the directory and is retried on the next call.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;

use crate::config::WorkerConfig;
use crate::error::{PackageError, WorkerError, WorkerResult};
use crate::metrics::MetricsRegistry;
use crate::puller::CodeDir;
use crate::sandbox::{offload, CreateRequest, Sandbox, SandboxMeta, SandboxPool};
use crate::types::{PackageName, RuntimeKind};

use super::DepTracer;

/// Source of the pip-install admin lambda, written under the worker dir at
/// startup.
pub const PIP_INSTALL_LAMBDA: &str = include_str!("pip_install.py");

/// What an installed package brings in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMeta {
    /// Direct requirements, normalized.
    pub deps: Vec<PackageName>,
    /// Importable top-level modules.
    pub top_level: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstallReply {
    #[serde(rename = "Deps", default)]
    deps: Vec<String>,
    #[serde(rename = "TopLevel", default)]
    top_level: Vec<String>,
}

#[derive(Debug)]
pub struct Package {
    name: PackageName,
    meta: OnceLock<PackageMeta>,
    installed: AtomicBool,
    install_lock: tokio::sync::Mutex<()>,
}

impl Package {
    fn new(name: PackageName) -> Self {
        Self {
            name,
            meta: OnceLock::new(),
            installed: AtomicBool::new(false),
            install_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }

    /// Set once the install succeeded.
    pub fn meta(&self) -> Option<&PackageMeta> {
        self.meta.get()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }
}

pub struct PackageInstaller {
    pool: Arc<SandboxPool>,
    pkgs_dir: PathBuf,
    installer_code: Arc<CodeDir>,
    installer_mem_mb: u64,
    packages: DashMap<PackageName, Arc<Package>>,
    tracer: Option<Arc<DepTracer>>,
    metrics: Arc<MetricsRegistry>,
    trace: bool,
}

impl std::fmt::Debug for PackageInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageInstaller")
            .field("pkgs_dir", &self.pkgs_dir)
            .field("packages", &self.packages.len())
            .finish()
    }
}

impl PackageInstaller {
    /// Write the admin lambda to `worker_dir/admin-lambdas/pip-install`.
    pub fn new(
        config: &WorkerConfig,
        pool: Arc<SandboxPool>,
        tracer: Option<Arc<DepTracer>>,
        metrics: Arc<MetricsRegistry>,
    ) -> WorkerResult<Self> {
        let io = |context: &'static str| move |source: std::io::Error| WorkerError::Io { context, source };

        let lambda_dir = config.worker_dir.join("admin-lambdas").join("pip-install");
        std::fs::create_dir_all(&lambda_dir).map_err(io("creating pip-install lambda dir"))?;
        std::fs::write(lambda_dir.join("f.py"), PIP_INSTALL_LAMBDA)
            .map_err(io("writing pip-install lambda"))?;
        std::fs::create_dir_all(&config.pkgs_dir).map_err(io("creating packages dir"))?;

        Ok(Self {
            pool,
            pkgs_dir: config.pkgs_dir.clone(),
            installer_code: CodeDir::fixed(lambda_dir, RuntimeKind::Python),
            installer_mem_mb: config.limits.installer_mem_mb,
            packages: DashMap::new(),
            tracer,
            metrics,
            trace: config.trace.package,
        })
    }

    pub fn pkgs_dir(&self) -> &Path {
        &self.pkgs_dir
    }

    /// Already-installed package, without triggering an install.
    pub fn installed(&self, name: &PackageName) -> Option<Arc<Package>> {
        self.packages
            .get(name)
            .filter(|p| p.is_installed())
            .map(|p| Arc::clone(&p))
    }

    /// Installed package `name`, installing it first if needed.
    pub async fn get_pkg(&self, name: &str) -> Result<Arc<Package>, PackageError> {
        let name = PackageName::normalize(name);
        let package = Arc::clone(
            &self
                .packages
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Package::new(name.clone()))),
        );

        if package.is_installed() {
            return Ok(package);
        }

        let holder = Arc::clone(&package);
        let _guard = holder.install_lock.lock().await;
        if package.is_installed() {
            return Ok(package);
        }

        let meta = self.install(&name).await?;
        if self.trace {
            tracing::debug!(package = %name, deps = ?meta.deps, top_level = ?meta.top_level, "Package installed");
        }
        let _ = package.meta.set(meta);
        package.installed.store(true, Ordering::Release);

        if let Some(tracer) = &self.tracer {
            tracer.trace_package(&package).await;
        }
        Ok(package)
    }

    /// Install `roots` and everything they depend on, breadth first.
    /// Returns every package visited, roots first.
    pub async fn install_recursive(
        &self,
        roots: &[PackageName],
    ) -> Result<Vec<PackageName>, PackageError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<PackageName> = VecDeque::new();
        for root in roots {
            if seen.insert(root.base().to_string()) {
                queue.push_back(root.clone());
            }
        }

        let mut visited = Vec::new();
        while let Some(next) = queue.pop_front() {
            let package = self.get_pkg(next.as_str()).await?;
            if let Some(meta) = package.meta() {
                for dep in &meta.deps {
                    if seen.insert(dep.base().to_string()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
            visited.push(next);
        }
        Ok(visited)
    }

    async fn install(&self, name: &PackageName) -> Result<PackageMeta, PackageError> {
        let scratch = self.pkgs_dir.join(name.as_str());
        let already_installed = scratch.exists();
        if !already_installed {
            tracing::info!(package = %name, dir = %scratch.display(), "Installing package");
            std::fs::create_dir_all(&scratch).map_err(|source| PackageError::Io {
                context: "creating package dir",
                source,
            })?;
        }

        let timer = self.metrics.t0("pip-install");
        let result = self.run_installer(name, &scratch, already_installed).await;
        timer.t1();

        if let Err(e) = &result {
            tracing::warn!(package = %name, error = %e, "Install failed; wiping package dir");
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                tracing::warn!(package = %name, error = %e, "Could not wipe package dir");
            }
        }
        result
    }

    async fn run_installer(
        &self,
        name: &PackageName,
        scratch: &Path,
        already_installed: bool,
    ) -> Result<PackageMeta, PackageError> {
        let request = CreateRequest {
            code: Some(Arc::clone(&self.installer_code)),
            scratch_dir: scratch.to_path_buf(),
            meta: SandboxMeta {
                mem_mb: self.installer_mem_mb,
                ..Default::default()
            },
            runtime: RuntimeKind::Python,
            is_leaf: true,
            keep_scratch: true,
        };

        let pool = Arc::clone(&self.pool);
        let sandbox = offload(move || pool.create(&request, None)).await?;

        let result = self.post_install(&sandbox, name, already_installed).await;
        offload(move || {
            sandbox.destroy("package install done");
            Ok(())
        })
        .await?;
        result
    }

    async fn post_install(
        &self,
        sandbox: &Sandbox,
        name: &PackageName,
        already_installed: bool,
    ) -> Result<PackageMeta, PackageError> {
        let failed = |reason: String| PackageError::InstallFailed {
            package: name.to_string(),
            reason,
        };

        let body = serde_json::json!({
            "pkg": name.as_str(),
            "alreadyInstalled": already_installed,
        });
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri("http://container/run/pip-install")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body.to_string()))
            .map_err(|e| failed(e.to_string()))?;

        let response = sandbox.client()?.send(request).await?;
        if !response.status().is_success() {
            return Err(failed(format!(
                "installer returned {}: {}",
                response.status(),
                String::from_utf8_lossy(response.body()).trim()
            )));
        }

        let reply: InstallReply = serde_json::from_slice(response.body())
            .map_err(|e| failed(format!("bad installer reply: {}", e)))?;
        Ok(PackageMeta {
            deps: reply
                .deps
                .iter()
                .map(|d| PackageName::normalize(d))
                .filter(|d| !d.is_empty())
                .collect(),
            top_level: reply.top_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_parsing() {
        let reply: InstallReply =
            serde_json::from_str(r#"{"Deps":["Idna","charset_normalizer"],"TopLevel":["requests"]}"#)
                .unwrap();
        assert_eq!(reply.deps, vec!["Idna", "charset_normalizer"]);
        assert_eq!(reply.top_level, vec!["requests"]);

        let empty: InstallReply = serde_json::from_str("{}").unwrap();
        assert!(empty.deps.is_empty());
    }

    #[test]
    fn test_package_flags() {
        let package = Package::new(PackageName::normalize("NumPy"));
        assert_eq!(package.name().as_str(), "numpy");
        assert!(!package.is_installed());
        assert!(package.meta().is_none());
    }

    #[test]
    fn test_admin_lambda_source() {
        assert!(PIP_INSTALL_LAMBDA.contains("def f(event)"));
        assert!(PIP_INSTALL_LAMBDA.contains("/host/files"));
    }
}
