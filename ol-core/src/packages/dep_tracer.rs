// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Dependency trace: a JSON-lines log of installed packages, functions and
//! invocations, used offline to design import-cache trees.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{WorkerError, WorkerResult};
use crate::types::PackageName;

use super::installer::Package;

const EVENT_BUFFER: usize = 128;

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TraceEvent {
    Package {
        name: String,
        deps: Vec<String>,
        top: Vec<String>,
    },
    Function {
        name: String,
        deps: Vec<String>,
    },
    Invocation {
        name: String,
    },
}

pub struct DepTracer {
    path: PathBuf,
    tx: Mutex<Option<mpsc::Sender<TraceEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DepTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepTracer").field("path", &self.path).finish()
    }
}

impl DepTracer {
    /// Truncate `path` and start the writer task. Must run inside a tokio
    /// runtime.
    pub async fn open(path: impl Into<PathBuf>) -> WorkerResult<Self> {
        let path = path.into();
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| WorkerError::Io {
                context: "creating dep trace",
                source: e,
            })?;

        let (tx, mut rx) = mpsc::channel::<TraceEvent>(EVENT_BUFFER);
        let log_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut out = tokio::io::BufWriter::new(file);
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not encode dep trace event");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = out.write_all(&line).await {
                    tracing::warn!(path = %log_path.display(), error = %e, "Dep trace write failed");
                    break;
                }
            }
            if let Err(e) = out.flush().await {
                tracing::warn!(path = %log_path.display(), error = %e, "Dep trace flush failed");
            }
        });

        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn emit(&self, event: TraceEvent) {
        let Some(tx) = self.tx.lock().clone() else {
            return;
        };
        // receiver only goes away after cleanup
        let _ = tx.send(event).await;
    }

    pub async fn trace_package(&self, package: &Package) {
        let (deps, top) = match package.meta() {
            Some(meta) => (
                meta.deps.iter().map(|d| d.to_string()).collect(),
                meta.top_level.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        self.emit(TraceEvent::Package {
            name: package.name().to_string(),
            deps,
            top,
        })
        .await;
    }

    pub async fn trace_function(&self, code_dir: &Path, direct_deps: &[PackageName]) {
        self.emit(TraceEvent::Function {
            name: code_dir.display().to_string(),
            deps: direct_deps.iter().map(|d| d.to_string()).collect(),
        })
        .await;
    }

    pub async fn trace_invocation(&self, code_dir: &Path) {
        self.emit(TraceEvent::Invocation {
            name: code_dir.display().to_string(),
        })
        .await;
    }

    /// Flush everything queued so far and close the file.
    pub async fn cleanup(&self) {
        drop(self.tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!(error = %e, "Dep trace writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dep-trace.json");
        let tracer = DepTracer::open(&path).await.unwrap();

        tracer
            .trace_function(
                Path::new("/code/1-echo"),
                &[PackageName::normalize("Requests")],
            )
            .await;
        tracer.trace_invocation(Path::new("/code/1-echo")).await;
        tracer.cleanup().await;

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "function");
        assert_eq!(lines[0]["deps"][0], "requests");
        assert_eq!(lines[1]["type"], "invocation");
        assert_eq!(lines[1]["name"], "/code/1-echo");
    }

    #[tokio::test]
    async fn test_events_after_cleanup_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dep-trace.json");
        let tracer = DepTracer::open(&path).await.unwrap();
        tracer.cleanup().await;

        tracer.trace_invocation(Path::new("/code/late")).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
