//! Error types for the lambda execution engine.
//!
//! Every failure is an explicit enum variant; there is no `Box<dyn Error>`
//! and no `anyhow`. `WorkerError::status_code` is the single place where
//! error kinds become HTTP statuses.

use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

use crate::types::{FunctionName, SandboxId};

/// Top-level error type for the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    // =========================================================================
    // Configuration Errors - Fatal at Startup
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    #[error("Worker already running? PID file exists at {path}")]
    StalePidFile { path: PathBuf },

    // =========================================================================
    // Invocation Errors - Returned to the Caller
    // =========================================================================
    #[error("HTTP method {method} not allowed for {function}; allowed: {allowed:?}")]
    MethodNotAllowed {
        function: FunctionName,
        method: String,
        allowed: Vec<String>,
    },

    #[error("lambda function queue is full")]
    TooManyRequests { function: FunctionName },

    #[error("Function {0} is shutting down")]
    FunctionDying(FunctionName),

    #[error("Not implemented: {feature}")]
    NotImplemented { feature: &'static str },

    // =========================================================================
    // Subsystem Errors
    // =========================================================================
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Code pull error: {0}")]
    Pull(#[from] PullError),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call failed: {syscall} - {message}")]
    Syscall {
        syscall: &'static str,
        message: String,
    },
}

impl WorkerError {
    /// HTTP status used when this error reaches a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::Pull(e) => e.status_code(),
            Self::Sandbox(e) => e.status_code(),
            Self::Package(PackageError::Sandbox(e)) => e.status_code(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Hard validation errors prevent the worker from starting.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid port: {port} - {reason}")]
    InvalidPort { port: u16, reason: String },

    #[error("Path must be absolute: {field} = {path}")]
    RelativePath { field: &'static str, path: PathBuf },

    #[error("Invalid override '{raw}': {reason}")]
    InvalidOverride { raw: String, reason: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Sandbox state machine errors.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition sandbox {sandbox} from {from} to {to}")]
    InvalidTransition {
        sandbox: SandboxId,
        from: &'static str,
        to: &'static str,
    },
}

/// Failures of sandbox creation, lifecycle operations and transport.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox {id} is dead: {reason}")]
    Dead { id: SandboxId, reason: String },

    #[error("Fork from zygote {parent} failed: {reason}")]
    ForkFailed { parent: SandboxId, reason: String },

    #[error("Timed out after {after_ms}ms: {operation}")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error("Requested {requested_mb}MB exceeds memory pool of {total_mb}MB")]
    Capacity { requested_mb: u64, total_mb: u64 },

    #[error("Cgroup {path} error: {reason}")]
    Cgroup { path: PathBuf, reason: String },

    #[error("Mount {target} failed: {reason}")]
    Mount { target: PathBuf, reason: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },

    #[error("Sandbox transport error: {reason}")]
    Transport { reason: String },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Whether the caller must fetch a fresh sandbox.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Dead { .. } | Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures while fetching and unpacking function code.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("Invalid function name {name:?}; must match [A-Za-z0-9._-]+")]
    BadName { name: String },

    #[error("Lambda {name} not found in blob store")]
    LambdaMissing { name: String },

    #[error("Invalid lambda code: {reason}")]
    CodeInvalid { reason: String },

    #[error("Blob store error: {reason}")]
    Blob { reason: String },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PullError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadName { .. } | Self::CodeInvalid { .. } => StatusCode::BAD_REQUEST,
            Self::LambdaMissing { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures of package installation.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Install of {package} failed: {reason}")]
    InstallFailed { package: String, reason: String },

    #[error("Installer sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using WorkerError.
pub type WorkerResult<T> = Result<T, WorkerError>;
