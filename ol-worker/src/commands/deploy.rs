// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol deploy` command - Upload a function to the worker's registry.
//!
//! Accepts a ready `.tar.gz` or a directory, which is packed first. The
//! archive's `ol.yaml` is checked locally before upload.

use std::io::Cursor;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use ol_core::lambda_config::extract_config_from_tar_gz;

use super::{saved_config, worker_url, CmdResult};

pub async fn execute(worker_dir: &Path, source: &Path, name: Option<&str>) -> CmdResult {
    let config = saved_config(worker_dir)?;

    let name = match name {
        Some(name) => name.to_string(),
        None => default_name(source)?,
    };
    let archive = if source.is_dir() {
        pack_dir(source)?
    } else {
        std::fs::read(source)?
    };

    let lambda_config = extract_config_from_tar_gz(Cursor::new(&archive))?;
    tracing::info!(function = %name, bytes = archive.len(), "Uploading function");

    let url = format!("{}/registry/{}", worker_url(&config), name);
    let response = reqwest::Client::new().post(&url).body(archive).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("upload rejected ({}): {}", status, body.trim()).into());
    }

    println!("✓ Deployed {}", name);
    println!(
        "  HTTP methods: {}",
        lambda_config.allowed_http_methods().join(", ")
    );
    println!("  Invoke with: curl -X POST {}/run/{}", worker_url(&config), name);
    Ok(())
}

/// `hello` for `hello/`, `hello.tar.gz` or `hello.tgz`.
fn default_name(source: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("cannot derive a function name from {}", source.display()))?;

    let name = file_name
        .strip_suffix(".tar.gz")
        .or_else(|| file_name.strip_suffix(".tgz"))
        .unwrap_or(file_name);
    Ok(name.to_string())
}

fn pack_dir(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()
}
