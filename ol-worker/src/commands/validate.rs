// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol validate` command - Validate a worker configuration file.

use ol_core::ConfigLoader;

use super::CmdResult;

pub async fn execute(file: &str, overrides: &[String]) -> CmdResult {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_with_overrides(file, overrides) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Worker Settings:");
            println!("  Worker Directory:  {}", config.worker_dir.display());
            println!("  Port:              {}", config.worker_port);
            println!("  Registry:          {}", config.registry);
            println!("  Sandbox:           {:?}", config.sandbox);
            println!("  Memory Pool:       {} MB", config.mem_pool_mb);
            println!("  Import Cache:      {:?}", config.features.import_cache);
            println!();
            println!("Sandbox Limits:");
            println!("  Memory:            {} MB", config.limits.mem_mb);
            println!("  CPU:               {}%", config.limits.cpu_percent);
            println!("  Processes:         {}", config.limits.procs);
            println!("  Runtime:           {}s", config.limits.runtime_sec);
            println!("  Installer Memory:  {} MB", config.limits.installer_mem_mb);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
