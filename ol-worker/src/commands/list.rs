// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol list` command - List functions in the worker's registry.

use std::path::Path;

use super::{get_text, saved_config, CmdResult};

pub async fn execute(worker_dir: &Path) -> CmdResult {
    let config = saved_config(worker_dir)?;
    let names: Vec<String> = serde_json::from_str(&get_text(&config, "/registry").await?)?;

    if names.is_empty() {
        println!("No functions in registry {}", config.registry);
        return Ok(());
    }

    for name in &names {
        println!("  • {}", name);
    }
    println!();
    println!("Total: {} function(s)", names.len());
    Ok(())
}
