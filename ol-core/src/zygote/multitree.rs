// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Several independent import-cache trees, spreading fork load over more
//! zygotes.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ImportCacheTree;
use crate::error::WorkerResult;
use crate::metrics::MetricsRegistry;
use crate::packages::PackageInstaller;
use crate::sandbox::{CreateRequest, Sandbox, SandboxPool};
use crate::types::PackageName;

use super::tree::ImportCache;

/// Two trees per CPU, at least 6 and at most 16.
pub fn tree_count(cpus: usize) -> usize {
    match cpus {
        0..=2 => 6,
        3..=10 => cpus * 2,
        _ => 16,
    }
}

#[derive(Debug)]
pub struct MultiTree {
    trees: Vec<Arc<ImportCache>>,
    next: AtomicUsize,
}

impl MultiTree {
    pub async fn new(
        source: &ImportCacheTree,
        pool: Arc<SandboxPool>,
        installer: Arc<PackageInstaller>,
        scratch_root: &Path,
        metrics: Arc<MetricsRegistry>,
    ) -> WorkerResult<Self> {
        let count = tree_count(num_cpus::get());
        tracing::info!(trees = count, "Starting multi-tree zygote provider");

        let mut trees = Vec::with_capacity(count);
        for _ in 0..count {
            match ImportCache::new(
                source,
                Arc::clone(&pool),
                Arc::clone(&installer),
                scratch_root,
                Arc::clone(&metrics),
            ) {
                Ok(tree) => trees.push(tree),
                Err(e) => {
                    for tree in &trees {
                        tree.cleanup().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            trees,
            next: AtomicUsize::new(0),
        })
    }

    pub fn trees(&self) -> &[Arc<ImportCache>] {
        &self.trees
    }

    /// Tree matching the most wanted packages; ties rotate.
    fn pick(&self, wanted: &[PackageName]) -> &Arc<ImportCache> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.trees.len();
        let mut best = start;
        let mut best_matched = self.trees[start].matched(wanted);
        for offset in 1..self.trees.len() {
            let i = (start + offset) % self.trees.len();
            let matched = self.trees[i].matched(wanted);
            if matched > best_matched {
                best = i;
                best_matched = matched;
            }
        }
        &self.trees[best]
    }

    pub async fn create(&self, request: &CreateRequest) -> WorkerResult<Arc<Sandbox>> {
        self.pick(&request.meta.installs).create(request).await
    }

    pub async fn warmup(&self) -> WorkerResult<()> {
        for tree in &self.trees {
            tree.warmup().await?;
        }
        Ok(())
    }

    pub fn dump(&self) -> String {
        self.trees
            .iter()
            .enumerate()
            .map(|(i, tree)| format!("TREE {}\n{}", i, tree.dump()))
            .collect()
    }

    pub async fn cleanup(&self) {
        for tree in &self.trees {
            tree.cleanup().await;
        }
    }
}
