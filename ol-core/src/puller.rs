// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Code puller: fetches `<name>.tar.gz` from the blob store and unpacks it
//! into a local directory, cached by blob version.
//!
//! A replaced code directory stays on disk while any sandbox still holds it;
//! the last [`Arc<CodeDir>`] to drop queues it for removal on a background
//! cleanup thread.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use dashmap::DashMap;
use flate2::read::GzDecoder;

use crate::blob::BlobStore;
use crate::error::{PullError, WorkerResult};
use crate::storage::{DirMaker, StoreMode};
use crate::types::{FunctionName, RuntimeKind};

/// An unpacked code directory.
#[derive(Debug)]
pub struct CodeDir {
    path: PathBuf,
    runtime: RuntimeKind,
    version: String,
    retire: Option<Sender<PathBuf>>,
}

impl CodeDir {
    /// A directory owned by someone else (admin lambdas, tests); never
    /// removed on drop.
    pub fn fixed(path: impl Into<PathBuf>, runtime: RuntimeKind) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            runtime,
            version: String::new(),
            retire: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    /// Blob version this directory was unpacked from.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Drop for CodeDir {
    fn drop(&mut self) {
        let Some(retire) = self.retire.take() else {
            return;
        };
        if let Err(mpsc::SendError(path)) = retire.send(self.path.clone()) {
            // cleanup thread is gone; do it inline
            let _ = std::fs::remove_dir_all(path);
        }
    }
}

pub struct CodePuller {
    store: Arc<dyn BlobStore>,
    dirs: DirMaker,
    cache: DashMap<FunctionName, Arc<CodeDir>>,
    retire_tx: Sender<PathBuf>,
}

impl std::fmt::Debug for CodePuller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodePuller")
            .field("store", &self.store)
            .field("dirs", &self.dirs)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl CodePuller {
    /// Unpack into `<code_root>/<n>-<name>`.
    pub fn new(store: Arc<dyn BlobStore>, code_root: impl Into<PathBuf>) -> WorkerResult<Self> {
        let dirs = DirMaker::new(code_root, StoreMode::Regular)?;

        let (retire_tx, retire_rx) = mpsc::channel::<PathBuf>();
        std::thread::Builder::new()
            .name("ol-code-cleanup".to_string())
            .spawn(move || {
                for path in retire_rx {
                    tracing::debug!(path = %path.display(), "Removing retired code dir");
                    if let Err(e) = std::fs::remove_dir_all(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "Could not remove code dir");
                    }
                }
            })
            .map_err(|e| crate::error::WorkerError::Io {
                context: "spawning code cleanup thread",
                source: e,
            })?;

        Ok(Self {
            store,
            dirs,
            cache: DashMap::new(),
            retire_tx,
        })
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Current code for `name`, downloading only when the blob changed.
    ///
    /// Blocks on blob I/O.
    pub fn pull(&self, name: &FunctionName) -> Result<Arc<CodeDir>, PullError> {
        let key = format!("{}.tar.gz", name);
        let attrs = self.store.attrs(&key).map_err(|e| match e {
            PullError::LambdaMissing { .. } => PullError::LambdaMissing {
                name: name.to_string(),
            },
            other => other,
        })?;

        if let Some(cached) = self.cache.get(name) {
            if cached.version == attrs.version && cached.path.exists() {
                return Ok(Arc::clone(&cached));
            }
        }

        let started = std::time::Instant::now();
        let dir = self.download(name, &key, &attrs.version)?;
        tracing::info!(
            function = %name,
            version = %attrs.version,
            size = attrs.size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pulled new code"
        );

        // dropping the previous entry retires it once no sandbox holds it
        self.cache.insert(name.clone(), Arc::clone(&dir));
        Ok(dir)
    }

    /// Forget the cached entry so the next pull downloads again.
    pub fn reset(&self, name: &FunctionName) {
        self.cache.remove(name);
    }

    fn download(&self, name: &FunctionName, key: &str, version: &str) -> Result<Arc<CodeDir>, PullError> {
        let io = |context: &'static str| move |source: std::io::Error| PullError::Io { context, source };

        let target = self.dirs.get(name.as_str());
        let archive = self.dirs.get(key);

        {
            let mut reader = self.store.reader(key)?;
            let mut file = File::create(&archive).map_err(io("creating download file"))?;
            std::io::copy(&mut reader, &mut file).map_err(io("downloading code"))?;
        }

        let unpacked = unpack(&archive, &target);
        let _ = std::fs::remove_file(&archive);
        if let Err(e) = unpacked {
            let _ = std::fs::remove_dir_all(&target);
            return Err(e);
        }

        let runtime = match detect_runtime(&target) {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&target);
                return Err(e);
            }
        };

        Ok(Arc::new(CodeDir {
            path: target,
            runtime,
            version: version.to_string(),
            retire: Some(self.retire_tx.clone()),
        }))
    }
}

fn unpack(archive: &Path, target: &Path) -> Result<(), PullError> {
    std::fs::create_dir(target).map_err(|source| PullError::Io {
        context: "creating code dir",
        source,
    })?;

    let file = File::open(archive).map_err(|source| PullError::Io {
        context: "opening download",
        source,
    })?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.unpack(target).map_err(|e| PullError::CodeInvalid {
        reason: format!("cannot extract archive: {}", e),
    })
}

/// `f.py` marks Python code, `f.bin` a native binary.
pub fn detect_runtime(dir: &Path) -> Result<RuntimeKind, PullError> {
    if dir.join("f.py").is_file() {
        Ok(RuntimeKind::Python)
    } else if dir.join("f.bin").is_file() {
        Ok(RuntimeKind::Native)
    } else {
        Err(PullError::CodeInvalid {
            reason: "archive has neither f.py nor f.bin".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FileBucket;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn write_lambda(registry: &Path, name: &str, files: &[(&str, &str)]) {
        let file = File::create(registry.join(format!("{}.tar.gz", name))).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn puller(dir: &TempDir) -> (PathBuf, CodePuller) {
        let registry = dir.path().join("registry");
        std::fs::create_dir(&registry).unwrap();
        let store = Arc::new(FileBucket::new(&registry).unwrap());
        let puller = CodePuller::new(store, dir.path().join("code")).unwrap();
        (registry, puller)
    }

    #[test]
    fn test_pull_and_cache() {
        let dir = TempDir::new().unwrap();
        let (registry, puller) = puller(&dir);
        write_lambda(&registry, "echo", &[("f.py", "def f(event): return event\n")]);

        let name = FunctionName::new("echo").unwrap();
        let first = puller.pull(&name).unwrap();
        assert_eq!(first.runtime(), RuntimeKind::Python);
        assert!(first.path().join("f.py").exists());

        let second = puller.pull(&name).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_new_version_retires_old_dir() {
        let dir = TempDir::new().unwrap();
        let (registry, puller) = puller(&dir);
        let name = FunctionName::new("echo").unwrap();

        write_lambda(&registry, "echo", &[("f.py", "v1\n")]);
        let old = puller.pull(&name).unwrap();
        let old_path = old.path().to_path_buf();

        // mtime granularity
        std::thread::sleep(Duration::from_millis(20));
        write_lambda(&registry, "echo", &[("f.py", "v2\n")]);
        let new = puller.pull(&name).unwrap();
        assert_ne!(old.version(), new.version());
        assert_ne!(old_path, new.path());

        // still referenced
        assert!(old_path.exists());
        drop(old);

        let deadline = Instant::now() + Duration::from_secs(2);
        while old_path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!old_path.exists());
        assert!(new.path().exists());
    }

    #[test]
    fn test_native_runtime() {
        let dir = TempDir::new().unwrap();
        let (registry, puller) = puller(&dir);
        write_lambda(&registry, "bin", &[("f.bin", "\x7fELF")]);

        let code = puller.pull(&FunctionName::new("bin").unwrap()).unwrap();
        assert_eq!(code.runtime(), RuntimeKind::Native);
    }

    #[test]
    fn test_missing_and_invalid() {
        let dir = TempDir::new().unwrap();
        let (registry, puller) = puller(&dir);

        let err = puller.pull(&FunctionName::new("nope").unwrap()).unwrap_err();
        assert!(matches!(err, PullError::LambdaMissing { ref name } if name == "nope"));

        write_lambda(&registry, "empty", &[("README", "hi")]);
        let err = puller.pull(&FunctionName::new("empty").unwrap()).unwrap_err();
        assert!(matches!(err, PullError::CodeInvalid { .. }));
    }

    #[test]
    fn test_fixed_dir_survives_drop() {
        let dir = TempDir::new().unwrap();
        let code = CodeDir::fixed(dir.path(), RuntimeKind::Python);
        drop(code);
        assert!(dir.path().exists());
    }
}
