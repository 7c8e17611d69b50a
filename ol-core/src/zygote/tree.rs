// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Import-cache tree.
//!
//! Each node names a set of packages; its zygote has imported the
//! top-level modules of those packages on top of everything its ancestors
//! imported. Leaves are forked from the deepest node whose packages the
//! lambda needs.
//!
//! Node sandboxes are created lazily and reference counted: a node's
//! zygote runs while a caller holds it or any child forked from it is
//! alive, and is paused otherwise. References owed to live children are
//! tracked from pool `Fork` / `ChildExit` events through a channel, so the
//! pool listener never blocks.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ImportCacheTree;
use crate::error::{HardValidationError, SandboxError, WorkerError, WorkerResult};
use crate::metrics::MetricsRegistry;
use crate::packages::PackageInstaller;
use crate::puller::CodeDir;
use crate::sandbox::{
    offload, CreateRequest, Sandbox, SandboxEventKind, SandboxMeta, SandboxPool,
};
use crate::storage::{DirMaker, StoreMode};
use crate::types::{PackageName, RuntimeKind, SandboxId};

/// Misses on the same package remainder before a node is added for it.
pub const PROMOTE_AFTER: u32 = 3;
/// Nodes stop growing new children at this fan-out.
pub const MAX_CHILDREN: usize = 8;
/// Leaf zygotes created concurrently by [`ImportCache::warmup`].
const WARMUP_PARALLELISM: usize = 6;

/// On-disk shape of a tree node.
#[derive(Debug, Default, Deserialize)]
struct NodeSpec {
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    children: Vec<NodeSpec>,
    #[serde(default)]
    split_generation: u64,
}

#[derive(Default)]
struct Slot {
    sandbox: Option<Arc<Sandbox>>,
    refs: usize,
}

struct Node {
    parent: Option<usize>,
    packages: Vec<PackageName>,
    /// Ancestors' packages followed by ours.
    all_packages: Vec<PackageName>,
    split_generation: u64,
    children: Mutex<Vec<usize>>,
    misses: Mutex<HashMap<Vec<PackageName>, u32>>,
    slot: tokio::sync::Mutex<Slot>,
    leaf_creates: AtomicU64,
    zygote_creates: AtomicU64,
    sandbox_creates: AtomicU64,
}

impl Node {
    fn new(
        parent: Option<&Node>,
        parent_index: Option<usize>,
        packages: Vec<PackageName>,
        split_generation: u64,
    ) -> Self {
        let mut all_packages = parent.map(|p| p.all_packages.clone()).unwrap_or_default();
        all_packages.extend(packages.iter().cloned());
        Self {
            parent: parent_index,
            packages,
            all_packages,
            split_generation,
            children: Mutex::new(Vec::new()),
            misses: Mutex::new(HashMap::new()),
            slot: tokio::sync::Mutex::new(Slot::default()),
            leaf_creates: AtomicU64::new(0),
            zygote_creates: AtomicU64::new(0),
            sandbox_creates: AtomicU64::new(0),
        }
    }

    fn label(&self) -> String {
        let mut label = if self.packages.is_empty() {
            "ROOT".to_string()
        } else {
            join(&self.packages)
        };
        let indirect = &self.all_packages[..self.all_packages.len() - self.packages.len()];
        if !indirect.is_empty() {
            label += &format!(" [indirect: {}]", join(indirect));
        }
        label
    }
}

fn join(packages: &[PackageName]) -> String {
    packages
        .iter()
        .map(PackageName::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy)]
enum RefMsg {
    /// A child was forked from this zygote.
    Hold(SandboxId),
    /// A caller is done with this zygote, or one of its children exited.
    Release(SandboxId),
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct ImportCache {
    nodes: RwLock<Vec<Arc<Node>>>,
    zygotes: DashMap<SandboxId, usize>,
    pool: Arc<SandboxPool>,
    installer: Arc<PackageInstaller>,
    scratch: DirMaker,
    metrics: Arc<MetricsRegistry>,
    refs_tx: mpsc::UnboundedSender<RefMsg>,
    refs_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ImportCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportCache")
            .field("nodes", &self.nodes.read().len())
            .field("zygotes", &self.zygotes.len())
            .finish()
    }
}

/// Read the configured tree; `Empty` yields a root-only tree.
fn load_spec(source: &ImportCacheTree) -> WorkerResult<NodeSpec> {
    let invalid = |message: String| {
        WorkerError::HardValidation(HardValidationError::SchemaValidation { message })
    };

    let spec: NodeSpec = match source {
        ImportCacheTree::Empty => NodeSpec::default(),
        ImportCacheTree::File(path) => {
            let body = std::fs::read_to_string(path).map_err(|e| {
                invalid(format!("could not read import cache tree {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&body).map_err(|e| {
                invalid(format!("could not parse import cache tree {}: {}", path.display(), e))
            })?
        }
        ImportCacheTree::Inline(value) => serde_json::from_value(value.clone())
            .map_err(|e| invalid(format!("could not parse import cache tree: {}", e)))?,
    };

    if !spec.packages.is_empty() {
        return Err(invalid(
            "root node in import cache may not import packages".to_string(),
        ));
    }
    Ok(spec)
}

/// Flatten in pre-order so parents precede their children.
fn flatten(spec: &NodeSpec, parent: Option<usize>, nodes: &mut Vec<Arc<Node>>) {
    let packages = spec.packages.iter().map(|p| PackageName::normalize(p)).collect();
    let node = Node::new(
        parent.map(|p| nodes[p].as_ref()),
        parent,
        packages,
        spec.split_generation,
    );
    let index = nodes.len();
    nodes.push(Arc::new(node));
    if let Some(parent) = parent {
        nodes[parent].children.lock().push(index);
    }
    for child in &spec.children {
        flatten(child, Some(index), nodes);
    }
}

impl ImportCache {
    /// Build the tree and subscribe to pool events. Must run inside a tokio
    /// runtime.
    pub fn new(
        source: &ImportCacheTree,
        pool: Arc<SandboxPool>,
        installer: Arc<PackageInstaller>,
        scratch_root: &Path,
        metrics: Arc<MetricsRegistry>,
    ) -> WorkerResult<Arc<Self>> {
        let spec = load_spec(source)?;
        let mut nodes = Vec::new();
        flatten(&spec, None, &mut nodes);

        let (refs_tx, refs_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            nodes: RwLock::new(nodes),
            zygotes: DashMap::new(),
            pool: Arc::clone(&pool),
            installer,
            scratch: DirMaker::new(scratch_root, StoreMode::Regular)?,
            metrics,
            refs_tx: refs_tx.clone(),
            refs_task: Mutex::new(None),
        });

        let task = tokio::spawn(refs_loop(Arc::downgrade(&cache), refs_rx));
        *cache.refs_task.lock() = Some(task);

        pool.add_listener(Box::new(move |event| {
            let msg = match event.kind {
                SandboxEventKind::Fork => RefMsg::Hold(event.sandbox.id()),
                SandboxEventKind::ChildExit => RefMsg::Release(event.sandbox.id()),
                _ => return,
            };
            // closed after cleanup
            let _ = refs_tx.send(msg);
        }));

        tracing::info!(nodes = cache.len(), "Import cache tree loaded\n{}", cache.dump());
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(&self, index: usize) -> Arc<Node> {
        Arc::clone(&self.nodes.read()[index])
    }

    /// Deepest node whose packages are all wanted, descending through the
    /// first matching child at each level.
    fn lookup(&self, wanted: &[PackageName]) -> usize {
        let nodes = self.nodes.read();
        let mut index = 0;
        'descend: loop {
            let children = nodes[index].children.lock().clone();
            for child in children {
                if nodes[child].packages.iter().all(|p| wanted.contains(p)) {
                    index = child;
                    continue 'descend;
                }
            }
            return index;
        }
    }

    /// Number of wanted packages the best node already imports.
    pub fn matched(&self, wanted: &[PackageName]) -> usize {
        let index = self.lookup(wanted);
        self.nodes.read()[index].all_packages.len()
    }

    /// [`lookup`](Self::lookup), growing the tree when the same remainder
    /// keeps missing below the chosen node.
    fn locate(&self, wanted: &[PackageName]) -> usize {
        let index = self.lookup(wanted);
        let node = self.node(index);

        let mut remainder: Vec<PackageName> = wanted
            .iter()
            .filter(|p| !node.all_packages.contains(p))
            .cloned()
            .collect();
        remainder.sort();
        remainder.dedup();
        if remainder.is_empty() {
            return index;
        }

        let misses = {
            let mut misses = node.misses.lock();
            let count = misses.entry(remainder.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if misses < PROMOTE_AFTER {
            return index;
        }

        let mut nodes = self.nodes.write();
        let mut children = node.children.lock();
        if let Some(&existing) = children.iter().find(|&&c| nodes[c].packages == remainder) {
            return existing;
        }
        if children.len() >= MAX_CHILDREN {
            return index;
        }

        let child = Node::new(Some(node.as_ref()), Some(index), remainder, node.split_generation);
        let child_index = nodes.len();
        children.push(child_index);
        drop(children);
        nodes.push(Arc::new(child));
        node.misses.lock().clear();

        tracing::info!(
            parent = %node.label(),
            node = %nodes[child_index].label(),
            "Promoted import cache node"
        );
        child_index
    }

    /// Create `request` (a leaf or a zygote) by forking from the best node.
    pub async fn create(&self, request: &CreateRequest) -> WorkerResult<Arc<Sandbox>> {
        let timer = self.metrics.t0("zygote.create");
        let index = self.locate(&request.meta.installs);
        tracing::debug!(node = %self.node(index).label(), "Using zygote");
        let result = self.create_from_node(index, request.clone()).await;
        timer.t1();
        result
    }

    /// Fork from `index`'s zygote, rebuilding it once if the fork fails.
    fn create_from_node(
        &self,
        index: usize,
        request: CreateRequest,
    ) -> BoxFuture<'_, WorkerResult<Arc<Sandbox>>> {
        Box::pin(async move {
            let node = self.node(index);
            let mut force_new = false;
            loop {
                let (zygote, is_new) = self.get(index, force_new).await?;

                let pool = Arc::clone(&self.pool);
                let child = request.clone();
                let parent = Arc::clone(&zygote);
                let created = offload(move || pool.create(&child, Some(&parent))).await;
                self.put(&zygote);

                match created {
                    Ok(sandbox) => {
                        let counter = if request.is_leaf {
                            &node.leaf_creates
                        } else {
                            &node.zygote_creates
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                        return Ok(sandbox);
                    }
                    Err(e @ SandboxError::ForkFailed { .. }) => {
                        self.metrics.inc("zygote.fork-failed");
                        if is_new {
                            tracing::warn!(node = %node.label(), error = %e, "Fork from fresh zygote failed");
                            return Err(e.into());
                        }
                        tracing::warn!(node = %node.label(), error = %e, "Fork failed; rebuilding zygote");
                        force_new = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        })
    }

    /// Take a reference on `index`'s zygote, creating it (and any missing
    /// ancestors) if needed. Returns whether it was newly created.
    fn get(&self, index: usize, force_new: bool) -> BoxFuture<'_, WorkerResult<(Arc<Sandbox>, bool)>> {
        Box::pin(async move {
            let node = self.node(index);
            let mut slot = node.slot.lock().await;

            if force_new {
                if let Some(old) = slot.sandbox.take() {
                    self.zygotes.remove(&old.id());
                    tokio::spawn(offload(move || {
                        old.destroy("zygote rebuilt after failed fork");
                        Ok(())
                    }));
                }
            }

            if let Some(zygote) = slot.sandbox.clone() {
                let usable = if zygote.is_dead() {
                    false
                } else if slot.refs == 0 {
                    let sb = Arc::clone(&zygote);
                    match offload(move || sb.unpause()).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(node = %node.label(), error = %e, "Zygote unpause failed");
                            false
                        }
                    }
                } else {
                    true
                };

                if usable {
                    slot.refs += 1;
                    return Ok((zygote, false));
                }
                self.zygotes.remove(&zygote.id());
                slot.sandbox = None;
            }

            let zygote = self.create_in_node(index, &node).await?;
            self.zygotes.insert(zygote.id(), index);
            slot.sandbox = Some(Arc::clone(&zygote));
            slot.refs = 1;
            Ok((zygote, true))
        })
    }

    /// Drop a reference taken by [`get`](Self::get). Queued behind any
    /// `Fork` hold from the same call, so the zygote is not paused under a
    /// fresh child.
    fn put(&self, zygote: &Sandbox) {
        let _ = self.refs_tx.send(RefMsg::Release(zygote.id()));
    }

    async fn apply(&self, msg: RefMsg) {
        let id = match msg {
            RefMsg::Hold(id) | RefMsg::Release(id) => id,
        };
        let Some(index) = self.zygotes.get(&id).map(|entry| *entry.value()) else {
            return;
        };
        let node = self.node(index);
        let mut slot = node.slot.lock().await;
        let Some(zygote) = slot.sandbox.clone() else {
            return;
        };
        if zygote.id() != id {
            // replaced after the reference was taken
            return;
        }

        match msg {
            RefMsg::Hold(_) => slot.refs += 1,
            RefMsg::Release(_) => {
                if slot.refs == 0 {
                    tracing::error!(sandbox = %id, node = %node.label(), "Zygote reference count underflow");
                    return;
                }
                slot.refs -= 1;
                if slot.refs == 0 {
                    let sb = Arc::clone(&zygote);
                    if let Err(e) = offload(move || sb.pause()).await {
                        tracing::warn!(node = %node.label(), error = %e, "Zygote pause failed");
                        self.zygotes.remove(&id);
                        slot.sandbox = None;
                    }
                }
            }
        }
    }

    async fn create_in_node(&self, index: usize, node: &Node) -> WorkerResult<Arc<Sandbox>> {
        let mut imports = Vec::new();
        for name in &node.all_packages {
            let package = self.installer.get_pkg(name.as_str()).await?;
            if node.packages.contains(name) {
                if let Some(meta) = package.meta() {
                    imports.extend(meta.top_level.iter().cloned());
                }
            }
        }

        let request = CreateRequest {
            code: None,
            scratch_dir: self.scratch.get(&format!("zygote-{}", index)),
            meta: SandboxMeta {
                installs: node.all_packages.clone(),
                imports,
                ..Default::default()
            },
            runtime: RuntimeKind::Python,
            is_leaf: false,
            keep_scratch: false,
        };

        let zygote = match node.parent {
            Some(parent) => self.create_from_node(parent, request).await?,
            None => {
                let pool = Arc::clone(&self.pool);
                offload(move || pool.create(&request, None)).await?
            }
        };
        node.sandbox_creates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node = %node.label(), sandbox = %zygote.id(), "Created zygote");
        Ok(zygote)
    }

    /// Create every leaf zygote once, forking a trivial lambda from each so
    /// its imports are known to work.
    pub async fn warmup(self: &Arc<Self>) -> WorkerResult<()> {
        let leaves: Vec<usize> = {
            let nodes = self.nodes.read();
            (0..nodes.len())
                .filter(|&i| nodes[i].children.lock().is_empty())
                .collect()
        };

        let code_dir = self.scratch.make("warmup-code")?;
        std::fs::write(code_dir.join("f.py"), "def f(event):\n    return None\n").map_err(|e| {
            WorkerError::Io {
                context: "writing warmup lambda",
                source: e,
            }
        })?;
        let code = CodeDir::fixed(&code_dir, RuntimeKind::Python);

        tracing::info!(zygotes = leaves.len(), "Warming up import cache");
        let limit = Arc::new(Semaphore::new(WARMUP_PARALLELISM));
        let mut tasks = JoinSet::new();
        for index in leaves {
            let cache = Arc::clone(self);
            let limit = Arc::clone(&limit);
            let request = CreateRequest {
                code: Some(Arc::clone(&code)),
                scratch_dir: self.scratch.get("warmup"),
                meta: SandboxMeta::default(),
                runtime: RuntimeKind::Python,
                is_leaf: true,
                keep_scratch: false,
            };
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.map_err(|e| SandboxError::Backend {
                    reason: format!("warmup limiter closed: {}", e),
                })?;
                let leaf = cache.create_from_node(index, request).await?;
                offload(move || {
                    leaf.destroy("warmup fork done");
                    Ok(())
                })
                .await?;
                Ok::<(), WorkerError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| WorkerError::Sandbox(SandboxError::Backend {
                reason: format!("warmup task failed: {}", e),
            }));
            if let Err(e) = result.and_then(|r| r) {
                tracing::warn!(error = %e, "Zygote warmup failed");
                first_error.get_or_insert(e);
            }
        }
        let _ = std::fs::remove_dir_all(&code_dir);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One line per node: child creates, then the node's packages.
    pub fn dump(&self) -> String {
        let nodes = self.nodes.read();
        let mut out = String::new();
        dump_node(&nodes, 0, 0, &mut out);
        out
    }

    /// Destroy every zygote, children before parents.
    pub async fn cleanup(&self) {
        tracing::info!("Import cache tree at shutdown\n{}", self.dump());

        let nodes: Vec<Arc<Node>> = self.nodes.read().iter().rev().cloned().collect();
        for node in nodes {
            let mut slot = node.slot.lock().await;
            if let Some(zygote) = slot.sandbox.take() {
                self.zygotes.remove(&zygote.id());
                slot.refs = 0;
                if let Err(e) = offload(move || {
                    zygote.destroy("import cache cleanup");
                    Ok(())
                })
                .await
                {
                    tracing::warn!(error = %e, "Zygote destroy failed");
                }
            }
        }

        if let Some(task) = self.refs_task.lock().take() {
            task.abort();
        }
    }
}

fn dump_node(nodes: &[Arc<Node>], index: usize, depth: usize, out: &mut String) {
    let node = &nodes[index];
    let creates = node.leaf_creates.load(Ordering::Relaxed) + node.zygote_creates.load(Ordering::Relaxed);
    out.push_str(&format!(
        "{:>4} {}{} (gen {}, zygotes created {})\n",
        creates,
        "  ".repeat(depth),
        node.label(),
        node.split_generation,
        node.sandbox_creates.load(Ordering::Relaxed),
    ));
    for &child in node.children.lock().iter() {
        dump_node(nodes, child, depth + 1, out);
    }
}

async fn refs_loop(cache: Weak<ImportCache>, mut rx: mpsc::UnboundedReceiver<RefMsg>) {
    while let Some(msg) = rx.recv().await {
        let Some(cache) = cache.upgrade() else {
            return;
        };
        cache.apply(msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nodes_from(value: serde_json::Value) -> Vec<Arc<Node>> {
        let spec = load_spec(&ImportCacheTree::Inline(value)).unwrap();
        let mut nodes = Vec::new();
        flatten(&spec, None, &mut nodes);
        nodes
    }

    fn names(raw: &[&str]) -> Vec<PackageName> {
        raw.iter().map(|p| PackageName::normalize(p)).collect()
    }

    #[test]
    fn test_flatten_tracks_indirect_packages() {
        let nodes = nodes_from(json!({
            "children": [
                {"packages": ["numpy"], "children": [{"packages": ["pandas"]}]},
                {"packages": ["requests"]}
            ]
        }));

        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[2].all_packages, names(&["numpy", "pandas"]));
        assert_eq!(nodes[2].parent, Some(1));
        assert_eq!(nodes[0].label(), "ROOT");
        assert_eq!(nodes[2].label(), "pandas [indirect: numpy]");
        assert_eq!(*nodes[0].children.lock(), vec![1, 3]);
    }

    #[test]
    fn test_root_may_not_import() {
        let err = load_spec(&ImportCacheTree::Inline(json!({"packages": ["numpy"]}))).unwrap_err();
        assert!(err.to_string().contains("root node"));
    }

    #[test]
    fn test_tree_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        std::fs::write(&path, r#"{"children": [{"packages": ["Flask"]}]}"#).unwrap();

        let spec = load_spec(&ImportCacheTree::File(path)).unwrap();
        assert_eq!(spec.children[0].packages, vec!["Flask"]);

        assert!(load_spec(&ImportCacheTree::File(dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_empty_tree_is_root_only() {
        let spec = load_spec(&ImportCacheTree::Empty).unwrap();
        let mut nodes = Vec::new();
        flatten(&spec, None, &mut nodes);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].all_packages.is_empty());
    }
}
