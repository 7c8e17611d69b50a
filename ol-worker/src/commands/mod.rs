// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod deploy;
pub mod down;
pub mod list;
pub mod stats;
pub mod status;
pub mod up;
pub mod validate;

use std::path::{Path, PathBuf};

use ol_core::{ConfigLoader, WorkerConfig};

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Absolute worker dir for `path`, relative to the current directory.
pub fn resolve_worker_dir(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Config a running (or previously started) worker saved in its dir.
pub fn saved_config(worker_dir: &Path) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let path = worker_dir.join("config.json");
    if !path.exists() {
        return Err(format!(
            "no config at {} (was the worker started with `ol up -p {}`?)",
            path.display(),
            worker_dir.display()
        )
        .into());
    }
    Ok(ConfigLoader::load_file(path)?)
}

/// Base URL of the worker's HTTP surface.
pub fn worker_url(config: &WorkerConfig) -> String {
    format!("http://localhost:{}", config.worker_port)
}

/// GET `path` on the worker and return the body of a 2xx response.
pub async fn get_text(config: &WorkerConfig, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let url = format!("{}{}", worker_url(config), path);
    let response = reqwest::get(&url)
        .await
        .map_err(|e| format!("worker unreachable at {}: {}", url, e))?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(format!("{} returned {}: {}", path, status, body.trim()).into());
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_worker_dir() {
        let abs = resolve_worker_dir(Path::new("/srv/ol/worker")).unwrap();
        assert_eq!(abs, PathBuf::from("/srv/ol/worker"));

        let rel = resolve_worker_dir(Path::new("default-ol/worker")).unwrap();
        assert!(rel.is_absolute());
        assert!(rel.ends_with("default-ol/worker"));
    }

    #[test]
    fn test_saved_config_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = saved_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no config"));
    }
}
