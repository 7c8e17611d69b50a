// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Blob store access for the function registry.
//!
//! `open` accepts a local path, a `file://` URL, or an `http(s)://` base URL.
//! Keys are flat object names such as `echo.tar.gz`. All calls block; async
//! callers go through `spawn_blocking`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::UNIX_EPOCH;

use crate::error::PullError;

/// Object metadata. `version` changes whenever the content is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttrs {
    pub size: u64,
    pub version: String,
}

/// Buffered upload; nothing is visible to readers until `commit`.
pub trait BlobWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<(), PullError>;
}

pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, PullError>;

    /// Missing keys are `LambdaMissing`.
    fn attrs(&self, key: &str) -> Result<BlobAttrs, PullError>;

    fn reader(&self, key: &str) -> Result<Box<dyn Read + Send>, PullError>;

    fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, PullError>;

    fn delete(&self, key: &str) -> Result<(), PullError>;
}

/// Open the store named by `url`.
pub fn open(url: &str) -> Result<Arc<dyn BlobStore>, PullError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(HttpBucket::new(url)));
    }

    let dir = url.strip_prefix("file://").unwrap_or(url);
    Ok(Arc::new(FileBucket::new(dir)?))
}

fn check_key(key: &str) -> Result<(), PullError> {
    if key.is_empty() || key.contains('/') || key == "." || key == ".." {
        return Err(PullError::BadName {
            name: key.to_string(),
        });
    }
    Ok(())
}

fn missing(key: &str) -> PullError {
    PullError::LambdaMissing {
        name: key.to_string(),
    }
}

// ============================================================================
// Local directory
// ============================================================================

#[derive(Debug)]
pub struct FileBucket {
    dir: PathBuf,
}

impl FileBucket {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PullError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PullError::Io {
            context: "creating registry directory",
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf, PullError> {
        check_key(key)?;
        Ok(self.dir.join(key))
    }
}

fn map_io<'a>(key: &'a str, context: &'static str) -> impl FnOnce(std::io::Error) -> PullError + 'a {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            missing(key)
        } else {
            PullError::Io { context, source: e }
        }
    }
}

impl BlobStore for FileBucket {
    fn list(&self, prefix: &str) -> Result<Vec<String>, PullError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| PullError::Io {
            context: "listing registry",
            source: e,
        })?;

        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(prefix) && !name.ends_with(".tmp"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn attrs(&self, key: &str) -> Result<BlobAttrs, PullError> {
        let meta = std::fs::metadata(self.path(key)?).map_err(map_io(key, "stat blob"))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Ok(BlobAttrs {
            size: meta.len(),
            version: mtime.to_string(),
        })
    }

    fn reader(&self, key: &str) -> Result<Box<dyn Read + Send>, PullError> {
        let file = File::open(self.path(key)?).map_err(map_io(key, "opening blob"))?;
        Ok(Box::new(file))
    }

    fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, PullError> {
        let target = self.path(key)?;
        let tmp = self.dir.join(format!("{}.tmp", key));
        let file = File::create(&tmp).map_err(|e| PullError::Io {
            context: "creating blob temp file",
            source: e,
        })?;
        Ok(Box::new(FileWriter {
            file: Some(file),
            tmp,
            target,
        }))
    }

    fn delete(&self, key: &str) -> Result<(), PullError> {
        std::fs::remove_file(self.path(key)?).map_err(map_io(key, "deleting blob"))
    }
}

/// Writes go to `<key>.tmp`; `commit` renames over the key.
struct FileWriter {
    file: Option<File>,
    tmp: PathBuf,
    target: PathBuf,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::other("blob writer already committed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BlobWriter for FileWriter {
    fn commit(mut self: Box<Self>) -> Result<(), PullError> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|e| PullError::Io {
                context: "syncing blob",
                source: e,
            })?;
        }
        std::fs::rename(&self.tmp, &self.target).map_err(|e| PullError::Io {
            context: "committing blob",
            source: e,
        })
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        // uncommitted
        if self.file.is_some() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

// ============================================================================
// HTTP object store
// ============================================================================

/// Object store reached over plain HTTP verbs on `<base>/<key>`.
/// `GET <base>/` returns a JSON array of keys.
#[derive(Debug)]
pub struct HttpBucket {
    base: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpBucket {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(reqwest::blocking::Client::new)
    }

    fn url(&self, key: &str) -> Result<String, PullError> {
        check_key(key)?;
        Ok(format!("{}/{}", self.base, key))
    }

    fn send(
        &self,
        key: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, PullError> {
        let response = request.send().map_err(|e| PullError::Blob {
            reason: e.to_string(),
        })?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(missing(key)),
            status if !status.is_success() => Err(PullError::Blob {
                reason: format!("{} returned {}", key, status),
            }),
            _ => Ok(response),
        }
    }
}

impl BlobStore for HttpBucket {
    fn list(&self, prefix: &str) -> Result<Vec<String>, PullError> {
        let response = self.send("", self.client().get(format!("{}/", self.base)))?;
        let keys: Vec<String> = response.json().map_err(|e| PullError::Blob {
            reason: format!("bad listing: {}", e),
        })?;

        let mut keys: Vec<String> = keys.into_iter().filter(|k| k.starts_with(prefix)).collect();
        keys.sort();
        Ok(keys)
    }

    fn attrs(&self, key: &str) -> Result<BlobAttrs, PullError> {
        let response = self.send(key, self.client().head(self.url(key)?))?;
        let headers = response.headers();

        let version = headers
            .get(reqwest::header::LAST_MODIFIED)
            .or_else(|| headers.get(reqwest::header::ETAG))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(BlobAttrs { size, version })
    }

    fn reader(&self, key: &str) -> Result<Box<dyn Read + Send>, PullError> {
        let response = self.send(key, self.client().get(self.url(key)?))?;
        Ok(Box::new(response))
    }

    fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, PullError> {
        Ok(Box::new(HttpWriter {
            bucket_url: self.url(key)?,
            client: self.client().clone(),
            buf: Vec::new(),
        }))
    }

    fn delete(&self, key: &str) -> Result<(), PullError> {
        self.send(key, self.client().delete(self.url(key)?))?;
        Ok(())
    }
}

/// Buffers the body and PUTs it on commit.
struct HttpWriter {
    bucket_url: String,
    client: reqwest::blocking::Client,
    buf: Vec<u8>,
}

impl Write for HttpWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for HttpWriter {
    fn commit(self: Box<Self>) -> Result<(), PullError> {
        let response = self
            .client
            .put(&self.bucket_url)
            .body(self.buf)
            .send()
            .map_err(|e| PullError::Blob {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PullError::Blob {
                reason: format!("PUT {} returned {}", self.bucket_url, response.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_bucket_write_read_delete() {
        let tmp = TempDir::new().unwrap();
        let store = open(&format!("file://{}", tmp.path().display())).unwrap();

        let mut writer = store.writer("echo.tar.gz").unwrap();
        writer.write_all(b"payload").unwrap();

        // not visible until commit
        assert!(store.attrs("echo.tar.gz").is_err());
        writer.commit().unwrap();

        let attrs = store.attrs("echo.tar.gz").unwrap();
        assert_eq!(attrs.size, 7);

        let mut body = String::new();
        store.reader("echo.tar.gz").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "payload");

        assert_eq!(store.list("").unwrap(), vec!["echo.tar.gz"]);

        store.delete("echo.tar.gz").unwrap();
        assert!(matches!(
            store.delete("echo.tar.gz"),
            Err(PullError::LambdaMissing { .. })
        ));
    }

    #[test]
    fn test_missing_key() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path().to_str().unwrap()).unwrap();

        assert!(matches!(
            store.attrs("nope.tar.gz"),
            Err(PullError::LambdaMissing { .. })
        ));
        assert!(store.reader("nope.tar.gz").is_err());
    }

    #[test]
    fn test_abandoned_writer_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = FileBucket::new(tmp.path()).unwrap();

        {
            let mut writer = store.writer("half.tar.gz").unwrap();
            writer.write_all(b"partial").unwrap();
        }

        assert!(store.list("").unwrap().is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_key_rejects_paths() {
        let tmp = TempDir::new().unwrap();
        let store = FileBucket::new(tmp.path()).unwrap();
        assert!(matches!(store.attrs("../x"), Err(PullError::BadName { .. })));
    }
}
