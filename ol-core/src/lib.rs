//! OpenLambda worker engine.
//!
//! Runs lambda functions inside lightweight sandboxes on a single worker:
//! code is pulled from a registry, Python packages are installed once and
//! shared, new sandboxes are forked from pre-initialized zygotes, and idle
//! sandboxes are evicted when the memory pool runs low.

pub mod blob;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod lambda;
pub mod lambda_config;
pub mod metrics;
pub mod packages;
pub mod puller;
pub mod sandbox;
pub mod state;
pub mod storage;
pub mod types;
pub mod zygote;

// Re-export commonly used types
pub use config::{ConfigLoader, ImportCacheMode, SandboxKind, WorkerConfig};
pub use error::{
    HardValidationError, PackageError, PullError, SandboxError, WorkerError, WorkerResult,
};
pub use lambda::FunctionManager;
pub use lambda_config::LambdaConfig;
pub use metrics::MetricsRegistry;
pub use state::{SandboxState, SandboxStateMachine};
pub use types::{FunctionName, PackageName, Port, RuntimeKind, SandboxId};
