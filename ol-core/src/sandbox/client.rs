// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! HTTP/1.1 transport to a sandbox runtime over `scratch/ol.sock`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::UnixStream;

use crate::error::SandboxError;

/// `sun_path` limit for Unix-domain sockets.
pub const MAX_SOCK_PATH: usize = 108;

/// Cheap to clone; clones share the idle connection list.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sock_path: PathBuf,
    timeout: Duration,
    idle: Mutex<Vec<SendRequest<Full<Bytes>>>>,
}

fn transport(context: &str, e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Transport {
        reason: format!("{}: {}", context, e),
    }
}

impl SandboxClient {
    /// `timeout` bounds each full round trip (connect, send, read body).
    pub fn new(sock_path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, SandboxError> {
        let sock_path = sock_path.into();
        if sock_path.as_os_str().len() > MAX_SOCK_PATH {
            return Err(SandboxError::Backend {
                reason: format!(
                    "socket path {} exceeds {} characters (move the worker dir closer to /)",
                    sock_path.display(),
                    MAX_SOCK_PATH
                ),
            });
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                sock_path,
                timeout,
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn sock_path(&self) -> &Path {
        &self.inner.sock_path
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Forward one request and buffer the response.
    pub async fn send(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, SandboxError> {
        let timeout = self.inner.timeout;
        match tokio::time::timeout(timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout {
                operation: "sandbox request",
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Drop pooled keep-alive connections.
    pub fn close_idle(&self) {
        self.inner.idle.lock().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    async fn round_trip(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, SandboxError> {
        let (mut parts, body) = request.into_parts();

        // a connection-level client speaks origin-form only
        if parts.uri.scheme().is_some() {
            let origin = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            parts.uri = origin
                .parse()
                .map_err(|e| transport("rewriting request uri", e))?;
        }
        if !parts.headers.contains_key(http::header::HOST) {
            parts.headers.insert(
                http::header::HOST,
                http::HeaderValue::from_static("localhost"),
            );
        }

        let request = http::Request::from_parts(parts, Full::new(body));
        let mut sender = self.checkout().await?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| transport("sending request", e))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| transport("reading response", e))?
            .to_bytes();

        if !sender.is_closed() {
            self.inner.idle.lock().push(sender);
        }

        Ok(http::Response::from_parts(parts, body))
    }

    async fn checkout(&self) -> Result<SendRequest<Full<Bytes>>, SandboxError> {
        loop {
            let pooled = self.inner.idle.lock().pop();
            match pooled {
                Some(mut sender) => {
                    if sender.ready().await.is_ok() {
                        return Ok(sender);
                    }
                }
                None => break,
            }
        }

        let stream = UnixStream::connect(&self.inner.sock_path)
            .await
            .map_err(|e| transport("connecting to sandbox", e))?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| transport("http handshake", e))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Sandbox connection closed");
            }
        });

        Ok(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use tempfile::TempDir;

    async fn serve(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("ol.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let app = Router::new().route(
            "/run/echo",
            post(|body: Bytes| async move { ([("x-echo", "yes")], body) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        path
    }

    #[test]
    fn test_path_limit() {
        let long = format!("/{}/ol.sock", "x".repeat(120));
        assert!(SandboxClient::new(long, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_and_keepalive() {
        let dir = TempDir::new().unwrap();
        let path = serve(&dir).await;
        let client = SandboxClient::new(path, Duration::from_secs(5)).unwrap();

        for i in 0..3 {
            let request = http::Request::post("http://container/run/echo")
                .body(Bytes::from(format!("hello {}", i)))
                .unwrap();
            let response = client.send(request).await.unwrap();

            assert_eq!(response.status(), http::StatusCode::OK);
            assert_eq!(response.headers()["x-echo"], "yes");
            assert_eq!(response.body(), &Bytes::from(format!("hello {}", i)));
        }

        assert_eq!(client.idle_count(), 1);
        client.close_idle();
        assert_eq!(client.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_socket_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let client =
            SandboxClient::new(dir.path().join("ol.sock"), Duration::from_secs(1)).unwrap();

        let request = http::Request::get("/").body(Bytes::new()).unwrap();
        assert!(matches!(
            client.send(request).await,
            Err(SandboxError::Transport { .. })
        ));
    }
}
