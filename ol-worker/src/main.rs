// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! OpenLambda worker CLI
//!
//! Runs the worker (`ol up`) and talks to a running one.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod metrics;
mod server;

/// OpenLambda worker - run lambdas in sandboxes forked from zygotes
#[derive(Parser)]
#[command(name = "ol")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Worker directory (holds config.json, worker.pid, code and scratch)
    #[arg(short, long, default_value = "default-ol/worker", global = true)]
    pub path: PathBuf,

    /// Config overrides, e.g. `-o mem_pool_mb=2048,limits.mem_mb=128`
    #[arg(short = 'o', long = "options", global = true)]
    pub overrides: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a worker in the foreground
    Up,

    /// Stop the worker running in the worker directory
    Down,

    /// Check that the worker is serving
    Status,

    /// Upload a function (directory or .tar.gz) to the registry
    Deploy {
        /// Function directory or archive
        source: PathBuf,

        /// Function name (defaults to the file or directory name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List functions in the registry
    List,

    /// Show engine statistics
    Stats {
        /// Refresh until interrupted
        #[arg(short, long)]
        watch: bool,
    },

    /// Validate a worker configuration file
    Validate {
        /// Path to config.json
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let worker_dir = commands::resolve_worker_dir(&cli.path)?;

    match cli.command {
        Commands::Up => commands::up::execute(&worker_dir, &cli.overrides).await,
        Commands::Down => commands::down::execute(&worker_dir).await,
        Commands::Status => commands::status::execute(&worker_dir).await,
        Commands::Deploy { source, name } => {
            commands::deploy::execute(&worker_dir, &source, name.as_deref()).await
        }
        Commands::List => commands::list::execute(&worker_dir).await,
        Commands::Stats { watch } => commands::stats::execute(&worker_dir, watch).await,
        Commands::Validate { file } => commands::validate::execute(&file, &cli.overrides).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_up_with_overrides() {
        let cli = Cli::try_parse_from([
            "ol",
            "up",
            "-p",
            "/srv/ol/worker",
            "-o",
            "mem_pool_mb=2048",
            "-o",
            "limits.mem_mb=128",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Up));
        assert_eq!(cli.path, PathBuf::from("/srv/ol/worker"));
        assert_eq!(cli.overrides, vec!["mem_pool_mb=2048", "limits.mem_mb=128"]);
    }

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from(["ol", "deploy", "hello.tar.gz", "--name", "hi"]).unwrap();
        match cli.command {
            Commands::Deploy { source, name } => {
                assert_eq!(source, PathBuf::from("hello.tar.gz"));
                assert_eq!(name.as_deref(), Some("hi"));
            }
            _ => panic!("expected deploy"),
        }
        assert_eq!(cli.path, PathBuf::from("default-ol/worker"));
    }
}
