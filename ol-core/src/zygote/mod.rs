// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Zygotes: pre-initialized sandboxes that new sandboxes are forked from.

mod multitree;
mod tree;

use std::sync::Arc;

use crate::config::{ImportCacheMode, WorkerConfig};
use crate::error::WorkerResult;
use crate::metrics::MetricsRegistry;
use crate::packages::PackageInstaller;
use crate::sandbox::{CreateRequest, Sandbox, SandboxPool};

pub use multitree::{tree_count, MultiTree};
pub use tree::{ImportCache, MAX_CHILDREN, PROMOTE_AFTER};

/// Configured zygote strategy.
#[derive(Debug)]
pub enum ZygoteProvider {
    Tree(Arc<ImportCache>),
    MultiTree(MultiTree),
}

impl ZygoteProvider {
    /// `None` when the import cache is off.
    pub async fn from_config(
        config: &WorkerConfig,
        pool: Arc<SandboxPool>,
        installer: Arc<PackageInstaller>,
        metrics: Arc<MetricsRegistry>,
    ) -> WorkerResult<Option<Self>> {
        let scratch = config.worker_dir.join("scratch");
        let source = &config.import_cache_tree;

        let provider = match config.features.import_cache {
            ImportCacheMode::Off => return Ok(None),
            ImportCacheMode::Tree => Self::Tree(ImportCache::new(
                source, pool, installer, &scratch, metrics,
            )?),
            ImportCacheMode::Multitree => {
                Self::MultiTree(MultiTree::new(source, pool, installer, &scratch, metrics).await?)
            }
        };

        if config.features.warmup {
            if let Err(e) = provider.warmup().await {
                provider.cleanup().await;
                return Err(e);
            }
        }
        Ok(Some(provider))
    }

    /// Fork a sandbox for `request` from the best matching zygote.
    pub async fn create(&self, request: &CreateRequest) -> WorkerResult<Arc<Sandbox>> {
        match self {
            Self::Tree(tree) => tree.create(request).await,
            Self::MultiTree(trees) => trees.create(request).await,
        }
    }

    pub async fn warmup(&self) -> WorkerResult<()> {
        match self {
            Self::Tree(tree) => tree.warmup().await,
            Self::MultiTree(trees) => trees.warmup().await,
        }
    }

    pub fn dump(&self) -> String {
        match self {
            Self::Tree(tree) => tree.dump(),
            Self::MultiTree(trees) => trees.dump(),
        }
    }

    pub async fn cleanup(&self) {
        match self {
            Self::Tree(tree) => tree.cleanup().await,
            Self::MultiTree(trees) => trees.cleanup().await,
        }
    }
}
