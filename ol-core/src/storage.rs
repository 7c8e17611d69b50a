// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Unique working directories.
//!
//! A [`DirMaker`] owns one prefix directory and hands out children named
//! `<id>-<suffix>` with a process-wide increasing id, so two callers never
//! share a directory even when they ask for the same suffix.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::SandboxError;

/// How the prefix directory is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Plain directory on the underlying filesystem.
    Regular,
    /// Bind-mounted onto itself and marked private, so mounts made below
    /// it do not propagate back to the host namespace.
    Private,
    /// tmpfs mounted on the prefix.
    Memory,
}

static NEXT_DIR_ID: AtomicU64 = AtomicU64::new(1000);

#[derive(Debug)]
pub struct DirMaker {
    prefix: PathBuf,
    mode: StoreMode,
}

impl DirMaker {
    /// Create (or reuse) the prefix directory and set up its backing.
    pub fn new(prefix: impl Into<PathBuf>, mode: StoreMode) -> Result<Self, SandboxError> {
        let prefix = prefix.into();

        std::fs::create_dir_all(&prefix).map_err(|e| SandboxError::Io {
            context: "creating storage prefix",
            source: e,
        })?;

        match mode {
            StoreMode::Regular => {}
            StoreMode::Private => {
                mount(
                    Some(&prefix),
                    &prefix,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(|e| SandboxError::Mount {
                    target: prefix.clone(),
                    reason: format!("bind self: {}", e),
                })?;
                mount(
                    None::<&str>,
                    &prefix,
                    None::<&str>,
                    MsFlags::MS_PRIVATE,
                    None::<&str>,
                )
                .map_err(|e| SandboxError::Mount {
                    target: prefix.clone(),
                    reason: format!("make private: {}", e),
                })?;
            }
            StoreMode::Memory => {
                mount(
                    Some("tmpfs"),
                    &prefix,
                    Some("tmpfs"),
                    MsFlags::empty(),
                    None::<&str>,
                )
                .map_err(|e| SandboxError::Mount {
                    target: prefix.clone(),
                    reason: format!("tmpfs: {}", e),
                })?;
            }
        }

        tracing::debug!(prefix = %prefix.display(), ?mode, "Storage prefix ready");

        Ok(Self { prefix, mode })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Reserve a fresh path without creating it.
    pub fn get(&self, suffix: &str) -> PathBuf {
        let id = NEXT_DIR_ID.fetch_add(1, Ordering::Relaxed);
        self.prefix.join(format!("{}-{}", id, suffix))
    }

    /// Reserve and create a fresh directory.
    pub fn make(&self, suffix: &str) -> Result<PathBuf, SandboxError> {
        let dir = self.get(suffix);
        std::fs::create_dir(&dir).map_err(|e| SandboxError::Io {
            context: "creating storage directory",
            source: e,
        })?;
        Ok(dir)
    }

    /// Unmount the prefix if needed and remove everything under it.
    pub fn cleanup(&self) {
        if self.mode != StoreMode::Regular {
            if let Err(e) = umount2(&self.prefix, MntFlags::MNT_DETACH) {
                tracing::warn!(prefix = %self.prefix.display(), error = %e, "Unmount failed");
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.prefix) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(prefix = %self.prefix.display(), error = %e, "Could not remove storage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unique_dirs() {
        let tmp = TempDir::new().unwrap();
        let maker = DirMaker::new(tmp.path().join("code"), StoreMode::Regular).unwrap();

        let a = maker.make("echo").unwrap();
        let b = maker.make("echo").unwrap();

        assert_ne!(a, b);
        assert!(a.is_dir());
        assert!(b.is_dir());
        assert!(a.file_name().unwrap().to_string_lossy().ends_with("-echo"));
        assert_eq!(a.parent().unwrap(), maker.prefix());
    }

    #[test]
    fn test_get_does_not_create() {
        let tmp = TempDir::new().unwrap();
        let maker = DirMaker::new(tmp.path().join("scratch"), StoreMode::Regular).unwrap();

        let dir = maker.get("x");
        assert!(!dir.exists());
    }

    #[test]
    fn test_cleanup() {
        let tmp = TempDir::new().unwrap();
        let maker = DirMaker::new(tmp.path().join("gone"), StoreMode::Regular).unwrap();
        maker.make("a").unwrap();

        maker.cleanup();
        assert!(!tmp.path().join("gone").exists());

        // second cleanup is quiet
        maker.cleanup();
    }
}
