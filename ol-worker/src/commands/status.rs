// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol status` command - Check that the worker answers.

use std::path::Path;

use super::{get_text, saved_config, CmdResult};

pub async fn execute(worker_dir: &Path) -> CmdResult {
    let config = saved_config(worker_dir)?;
    let status = get_text(&config, "/status").await?;
    let pid = get_text(&config, "/pid").await?;

    println!(
        "● worker {} on port {} (pid {})",
        status.trim(),
        config.worker_port,
        pid.trim()
    );
    Ok(())
}
