// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol up` command - Run a worker in the foreground.
//!
//! Loads (or creates) `<worker_dir>/config.json`, applies `-o` overrides,
//! claims the PID file, serves the HTTP surface until SIGINT/SIGTERM, then
//! tears the engine down.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ol_core::config::apply_overrides;
use ol_core::{ConfigLoader, FunctionManager, WorkerConfig, WorkerError, WorkerResult};

use super::CmdResult;
use crate::{metrics, server};

pub async fn execute(worker_dir: &Path, overrides: &[String]) -> CmdResult {
    let config = Arc::new(load_config(worker_dir, overrides)?);
    tracing::info!(
        worker_dir = %config.worker_dir.display(),
        port = %config.worker_port,
        sandbox = ?config.sandbox,
        "Starting worker"
    );

    std::fs::create_dir_all(&config.worker_dir).map_err(|e| WorkerError::Io {
        context: "creating worker dir",
        source: e,
    })?;
    config.save(config.config_path())?;

    let pid_file = PidFile::claim(config.pid_path())?;
    let result = serve(Arc::clone(&config)).await;
    drop(pid_file);

    result
}

/// Saved config when present, else defaults rooted at `worker_dir`;
/// overrides apply either way.
pub fn load_config(worker_dir: &Path, overrides: &[String]) -> WorkerResult<WorkerConfig> {
    let path = worker_dir.join("config.json");
    if path.exists() {
        return ConfigLoader::load_with_overrides(path, overrides);
    }

    let mut doc = serde_json::json!({ "worker_dir": worker_dir });
    for raw in overrides {
        apply_overrides(&mut doc, raw)?;
    }
    ConfigLoader::load_string(&doc.to_string())
}

async fn serve(config: Arc<WorkerConfig>) -> CmdResult {
    metrics::init();
    let manager = Arc::new(FunctionManager::new(Arc::clone(&config)).await?);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.worker_port.value()));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            manager.cleanup().await;
            return Err(format!("cannot listen on {}: {}", addr, e).into());
        }
    };

    println!("Worker ready on http://{} (pid {})", addr, std::process::id());
    tracing::info!(%addr, "Worker listening");

    let app = server::router(Arc::clone(&manager));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&manager)))
        .await;

    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
        manager.cleanup().await;
    }
    served?;
    println!("Worker stopped.");
    Ok(())
}

/// Resolves once SIGINT or SIGTERM arrives and the engine has shut down.
///
/// Cleanup runs before the server drains, so in-flight requests fail fast
/// on their destroyed sandboxes instead of holding shutdown open.
async fn shutdown_signal(manager: Arc<FunctionManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down worker");
    manager.cleanup().await;
}

/// `worker.pid`, removed again on drop.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Fails if the file already exists: another worker may own the dir.
    fn claim(path: PathBuf) -> WorkerResult<Self> {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => WorkerError::StalePidFile { path: path.clone() },
                _ => WorkerError::Io {
                    context: "creating PID file",
                    source: e,
                },
            })?;
        writeln!(file, "{}", std::process::id()).map_err(|e| WorkerError::Io {
            context: "writing PID file",
            source: e,
        })?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not remove PID file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_defaults_with_overrides() {
        let dir = TempDir::new().unwrap();
        let worker_dir = dir.path().join("worker");

        let config = load_config(
            &worker_dir,
            &["worker_port=6000,limits.mem_mb=128".to_string(), "mem_pool_mb=1024".to_string()],
        )
        .unwrap();

        assert_eq!(config.worker_dir, worker_dir);
        assert_eq!(config.worker_port.value(), 6000);
        assert_eq!(config.limits.mem_mb, 128);
        assert_eq!(config.mem_pool_mb, 1024);
        assert_eq!(config.registry, dir.path().join("registry").to_string_lossy());
    }

    #[test]
    fn test_load_config_prefers_saved_file() {
        let dir = TempDir::new().unwrap();
        let worker_dir = dir.path().join("worker");
        std::fs::create_dir_all(&worker_dir).unwrap();

        let saved = load_config(&worker_dir, &["worker_port=7001".to_string(), "mem_pool_mb=1024".to_string()]).unwrap();
        saved.save(saved.config_path()).unwrap();

        let reloaded = load_config(&worker_dir, &[]).unwrap();
        assert_eq!(reloaded.worker_port.value(), 7001);

        let overridden = load_config(&worker_dir, &["worker_port=7002".to_string()]).unwrap();
        assert_eq!(overridden.worker_port.value(), 7002);
    }

    #[test]
    fn test_pid_file_claim_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.pid");

        let pid = PidFile::claim(path.clone()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        let err = PidFile::claim(path.clone()).err().unwrap();
        assert!(matches!(err, WorkerError::StalePidFile { .. }));

        drop(pid);
        assert!(!path.exists());
    }
}
