// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker configuration with strict validation.
//!
//! `config.json` is parsed into private `Raw*` structs whose unset fields take
//! defaults, then validated into a [`WorkerConfig`]. Any invalid field is a
//! [`HardValidationError`] and the worker refuses to start. The validated
//! config is shared as `Arc<WorkerConfig>`; nothing reads a global.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HardValidationError, WorkerError, WorkerResult};
use crate::types::Port;

/// Sandbox backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Sock,
    Docker,
    Containerd,
}

/// How leaf sandboxes find a zygote to fork from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportCacheMode {
    Off,
    #[serde(alias = "")]
    Tree,
    Multitree,
}

/// Raw per-sandbox limits as parsed from JSON (before validation).
#[derive(Debug, Deserialize, Default)]
struct RawLimits {
    procs: Option<u64>,
    mem_mb: Option<u64>,
    cpu_percent: Option<u64>,
    #[serde(alias = "max_runtime_default")]
    runtime_sec: Option<u64>,
    installer_mem_mb: Option<u64>,
    swappiness: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFeatures {
    #[serde(default = "default_import_cache")]
    import_cache: ImportCacheMode,
    #[serde(default = "default_true")]
    downsize_paused_mem: bool,
    #[serde(default = "default_true")]
    enable_seccomp: bool,
    #[serde(default = "default_true")]
    reuse_cgroups: bool,
    #[serde(default)]
    warmup: bool,
}

impl Default for RawFeatures {
    fn default() -> Self {
        Self {
            import_cache: default_import_cache(),
            downsize_paused_mem: true,
            enable_seccomp: true,
            reuse_cgroups: true,
            warmup: false,
        }
    }
}

fn default_import_cache() -> ImportCacheMode {
    ImportCacheMode::Tree
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
struct RawDocker {
    base_image: Option<String>,
    runtime: Option<String>,
}

/// Raw root configuration.
#[derive(Debug, Deserialize)]
struct RawConfig {
    worker_dir: Option<String>,
    #[serde(default = "default_worker_port")]
    worker_port: u16,
    registry: Option<String>,
    #[serde(default = "default_registry_cache_ms")]
    registry_cache_ms: u64,
    #[serde(default = "default_sandbox")]
    sandbox: SandboxKind,
    #[serde(alias = "SOCK_base_path")]
    sock_base_path: Option<String>,
    #[serde(default = "default_sock_init")]
    sock_init: String,
    pkgs_dir: Option<String>,
    #[serde(default = "default_cgroup_root")]
    cgroup_root: String,
    mem_pool_mb: Option<u64>,
    #[serde(default = "default_queue_depth")]
    queue_depth: usize,
    #[serde(default)]
    import_cache_tree: Value,
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    features: RawFeatures,
    #[serde(default)]
    trace: TraceFlags,
    #[serde(default)]
    docker: RawDocker,
}

fn default_worker_port() -> u16 {
    5000
}

fn default_registry_cache_ms() -> u64 {
    5000
}

fn default_sandbox() -> SandboxKind {
    SandboxKind::Sock
}

fn default_sock_init() -> String {
    "/usr/local/bin/sock-init".to_string()
}

fn default_cgroup_root() -> String {
    "/sys/fs/cgroup".to_string()
}

fn default_queue_depth() -> usize {
    32
}

/// Validated per-sandbox limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub procs: u64,
    pub mem_mb: u64,
    pub cpu_percent: u64,
    pub runtime_sec: u64,
    pub installer_mem_mb: u64,
    pub swappiness: u64,
}

/// Feature switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub import_cache: ImportCacheMode,
    pub downsize_paused_mem: bool,
    pub enable_seccomp: bool,
    pub reuse_cgroups: bool,
    pub warmup: bool,
}

/// Subsystems whose per-event debug logging is enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceFlags {
    #[serde(default)]
    pub cgroups: bool,
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub evictor: bool,
    #[serde(default)]
    pub package: bool,
    #[serde(default)]
    pub latency: bool,
}

/// Container daemon settings for the docker / containerd backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub base_image: String,
    pub runtime: Option<String>,
}

/// Where the static zygote tree comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImportCacheTree {
    /// Root-only tree.
    Empty,
    /// Path to a JSON tree file.
    File(PathBuf),
    /// Tree given inline in the config.
    Inline(Value),
}

/// Complete validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_dir: PathBuf,
    pub worker_port: Port,
    pub registry: String,
    pub registry_cache_ms: u64,
    pub sandbox: SandboxKind,
    pub sock_base_path: PathBuf,
    pub sock_init: PathBuf,
    pub pkgs_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub mem_pool_mb: u64,
    pub queue_depth: usize,
    pub import_cache_tree: ImportCacheTree,
    pub limits: Limits,
    pub features: Features,
    pub trace: TraceFlags,
    pub docker: DockerConfig,
}

impl WorkerConfig {
    /// Defaults rooted at `worker_dir`.
    pub fn with_worker_dir(worker_dir: impl Into<PathBuf>) -> WorkerResult<Self> {
        let worker_dir = worker_dir.into();
        let value = serde_json::json!({ "worker_dir": worker_dir.to_string_lossy() });
        ConfigLoader::load_value(value)
    }

    /// `<worker_dir>/worker.pid`
    pub fn pid_path(&self) -> PathBuf {
        self.worker_dir.join("worker.pid")
    }

    /// `<worker_dir>/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.worker_dir.join("config.json")
    }

    /// Write this configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> WorkerResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| WorkerError::ConfigParse {
            message: format!("JSON encode error: {}", e),
        })?;
        std::fs::write(path, json).map_err(|e| WorkerError::Io {
            context: "writing config file",
            source: e,
        })
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a JSON file.
    pub fn load_file(path: impl AsRef<Path>) -> WorkerResult<WorkerConfig> {
        Self::load_with_overrides(path, &[])
    }

    /// Load a JSON file, apply `key=value` overrides, then validate.
    ///
    /// Each override may hold several comma-separated assignments. Dotted
    /// keys reach into nested objects (`limits.mem_mb=128`). Values are
    /// parsed as JSON when possible and kept as strings otherwise.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &[String],
    ) -> WorkerResult<WorkerConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(WorkerError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| WorkerError::Io {
            context: "reading config file",
            source: e,
        })?;

        let mut value: Value =
            serde_json::from_str(&content).map_err(|e| WorkerError::ConfigParse {
                message: format!("JSON parse error: {}", e),
            })?;

        for raw in overrides {
            apply_overrides(&mut value, raw)?;
        }

        Self::load_value(value)
    }

    /// Load and validate configuration from a JSON string.
    pub fn load_string(content: &str) -> WorkerResult<WorkerConfig> {
        let value: Value = serde_json::from_str(content).map_err(|e| WorkerError::ConfigParse {
            message: format!("JSON parse error: {}", e),
        })?;
        Self::load_value(value)
    }

    fn load_value(value: Value) -> WorkerResult<WorkerConfig> {
        let raw: RawConfig =
            serde_json::from_value(value).map_err(|e| WorkerError::ConfigParse {
                message: format!("JSON schema error: {}", e),
            })?;
        Self::validate(raw)
    }

    /// Fill derived defaults and validate.
    fn validate(raw: RawConfig) -> WorkerResult<WorkerConfig> {
        let worker_dir = match raw.worker_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()
                .map_err(|e| WorkerError::Io {
                    context: "resolving current directory",
                    source: e,
                })?
                .join("default-ol")
                .join("worker"),
        };

        if !worker_dir.is_absolute() {
            return Err(HardValidationError::RelativePath {
                field: "worker_dir",
                path: worker_dir,
            }
            .into());
        }

        // sibling directories default to live next to worker_dir
        let ol_dir = worker_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| worker_dir.clone());

        let worker_port = Port::new(raw.worker_port)?;
        let registry = raw
            .registry
            .unwrap_or_else(|| ol_dir.join("registry").to_string_lossy().into_owned());
        let sock_base_path = raw
            .sock_base_path
            .map(PathBuf::from)
            .unwrap_or_else(|| ol_dir.join("lambda"));
        let pkgs_dir = raw
            .pkgs_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| ol_dir.join("lambda").join("packages"));

        let mem_pool_mb = match raw.mem_pool_mb {
            Some(mb) => mb,
            None => total_memory_mb()
                .map(|total| total.saturating_sub(500).max(500))
                .unwrap_or(500),
        };

        let limits = Limits {
            procs: raw.limits.procs.unwrap_or(10),
            mem_mb: raw.limits.mem_mb.unwrap_or(50),
            cpu_percent: raw.limits.cpu_percent.unwrap_or(100),
            runtime_sec: raw.limits.runtime_sec.unwrap_or(30),
            installer_mem_mb: raw
                .limits
                .installer_mem_mb
                .unwrap_or_else(|| (mem_pool_mb / 2).clamp(250, 500)),
            swappiness: raw.limits.swappiness.unwrap_or(0),
        };

        for (field, value) in [
            ("limits.procs", limits.procs),
            ("limits.mem_mb", limits.mem_mb),
            ("limits.cpu_percent", limits.cpu_percent),
            ("limits.runtime_sec", limits.runtime_sec),
            ("limits.installer_mem_mb", limits.installer_mem_mb),
        ] {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: value.to_string(),
                    reason: "Must be greater than zero".to_string(),
                }
                .into());
            }
        }

        if raw.queue_depth == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "queue_depth",
                value: "0".to_string(),
                reason: "Must be greater than zero".to_string(),
            }
            .into());
        }

        if raw.sandbox == SandboxKind::Sock {
            if !sock_base_path.is_absolute() {
                return Err(HardValidationError::RelativePath {
                    field: "sock_base_path",
                    path: sock_base_path,
                }
                .into());
            }

            let min_mem = 2 * limits.installer_mem_mb.max(limits.mem_mb);
            if mem_pool_mb < min_mem {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "mem_pool_mb",
                    value: mem_pool_mb.to_string(),
                    reason: format!(
                        "Must be at least {}MB (2x max(installer_mem_mb, mem_mb))",
                        min_mem
                    ),
                }
                .into());
            }
        }

        let import_cache_tree = match raw.import_cache_tree {
            Value::Null => ImportCacheTree::Empty,
            Value::String(s) if s.is_empty() => ImportCacheTree::Empty,
            Value::String(s) if s.starts_with('{') && s.ends_with('}') => {
                let inline = serde_json::from_str(&s).map_err(|e| {
                    HardValidationError::InvalidFieldValue {
                        field: "import_cache_tree",
                        value: s.clone(),
                        reason: e.to_string(),
                    }
                })?;
                ImportCacheTree::Inline(inline)
            }
            Value::String(s) => ImportCacheTree::File(PathBuf::from(s)),
            obj @ Value::Object(_) => ImportCacheTree::Inline(obj),
            other => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "import_cache_tree",
                    value: other.to_string(),
                    reason: "Expected a file path or a JSON object".to_string(),
                }
                .into())
            }
        };

        let features = Features {
            import_cache: raw.features.import_cache,
            downsize_paused_mem: raw.features.downsize_paused_mem,
            enable_seccomp: raw.features.enable_seccomp,
            reuse_cgroups: raw.features.reuse_cgroups,
            warmup: raw.features.warmup,
        };

        let docker = DockerConfig {
            base_image: raw
                .docker
                .base_image
                .unwrap_or_else(|| "ol-min".to_string()),
            runtime: raw.docker.runtime,
        };

        Ok(WorkerConfig {
            worker_dir,
            worker_port,
            registry,
            registry_cache_ms: raw.registry_cache_ms,
            sandbox: raw.sandbox,
            sock_base_path,
            sock_init: PathBuf::from(raw.sock_init),
            pkgs_dir,
            cgroup_root: PathBuf::from(raw.cgroup_root),
            mem_pool_mb,
            queue_depth: raw.queue_depth,
            import_cache_tree,
            limits,
            features,
            trace: raw.trace,
            docker,
        })
    }
}

/// Apply one `-o` argument (`a=1,b.c=x`) to a JSON document.
pub fn apply_overrides(doc: &mut Value, raw: &str) -> Result<(), HardValidationError> {
    for assignment in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (key, value) =
            assignment
                .split_once('=')
                .ok_or_else(|| HardValidationError::InvalidOverride {
                    raw: assignment.to_string(),
                    reason: "expected key=value".to_string(),
                })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(HardValidationError::InvalidOverride {
                raw: assignment.to_string(),
                reason: "empty key".to_string(),
            });
        }

        let parsed = serde_json::from_str(value.trim())
            .unwrap_or_else(|_| Value::String(value.trim().to_string()));

        let mut cursor = &mut *doc;
        let parts: Vec<&str> = key.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            if !cursor.is_object() {
                *cursor = Value::Object(serde_json::Map::new());
            }
            let map = match cursor.as_object_mut() {
                Some(map) => map,
                None => unreachable!("cursor was just made an object"),
            };
            if i + 1 == parts.len() {
                map.insert(part.to_string(), parsed.clone());
                break;
            }
            cursor = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
    }
    Ok(())
}

/// Total host memory in MB from `/proc/meminfo`.
fn total_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{ "worker_dir": "/tmp/ol/worker", "mem_pool_mb": 1024 }"#;

    #[test]
    fn test_defaults() {
        let config = ConfigLoader::load_string(MINIMAL).unwrap();

        assert_eq!(config.worker_port.value(), 5000);
        assert_eq!(config.registry, "/tmp/ol/registry");
        assert_eq!(config.sock_base_path, PathBuf::from("/tmp/ol/lambda"));
        assert_eq!(config.pkgs_dir, PathBuf::from("/tmp/ol/lambda/packages"));
        assert_eq!(config.registry_cache_ms, 5000);
        assert_eq!(config.sandbox, SandboxKind::Sock);
        assert_eq!(config.limits.mem_mb, 50);
        assert_eq!(config.limits.procs, 10);
        assert_eq!(config.limits.runtime_sec, 30);
        assert_eq!(config.limits.installer_mem_mb, 500);
        assert_eq!(config.features.import_cache, ImportCacheMode::Tree);
        assert!(config.features.reuse_cgroups);
        assert!(matches!(config.import_cache_tree, ImportCacheTree::Empty));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/ol/worker/worker.pid"));
    }

    #[test]
    fn test_installer_mem_tracks_pool() {
        let config =
            ConfigLoader::load_string(r#"{ "worker_dir": "/w/worker", "mem_pool_mb": 600 }"#)
                .unwrap();
        assert_eq!(config.limits.installer_mem_mb, 300);
    }

    #[test]
    fn test_relative_worker_dir_rejected() {
        let result = ConfigLoader::load_string(r#"{ "worker_dir": "relative/worker" }"#);
        assert!(matches!(
            result,
            Err(WorkerError::HardValidation(HardValidationError::RelativePath { .. }))
        ));
    }

    #[test]
    fn test_mem_pool_too_small() {
        let result = ConfigLoader::load_string(
            r#"{ "worker_dir": "/w/worker", "mem_pool_mb": 100, "limits": { "installer_mem_mb": 250 } }"#,
        );
        assert!(matches!(
            result,
            Err(WorkerError::HardValidation(HardValidationError::InvalidFieldValue {
                field: "mem_pool_mb",
                ..
            }))
        ));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = ConfigLoader::load_string(
            r#"{ "worker_dir": "/w/worker", "mem_pool_mb": 1024, "limits": { "mem_mb": 0 } }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_docker_skips_sock_checks() {
        let config = ConfigLoader::load_string(
            r#"{ "worker_dir": "/w/worker", "sandbox": "docker", "mem_pool_mb": 10, "limits": { "installer_mem_mb": 250 } }"#,
        )
        .unwrap();
        assert_eq!(config.sandbox, SandboxKind::Docker);
        assert_eq!(config.docker.base_image, "ol-min");
    }

    #[test]
    fn test_inline_import_tree() {
        let config = ConfigLoader::load_string(
            r#"{ "worker_dir": "/w/worker", "mem_pool_mb": 1024,
                 "import_cache_tree": { "packages": [], "children": [ { "packages": ["numpy"] } ] } }"#,
        )
        .unwrap();
        assert!(matches!(config.import_cache_tree, ImportCacheTree::Inline(_)));

        let config = ConfigLoader::load_string(
            r#"{ "worker_dir": "/w/worker", "mem_pool_mb": 1024, "import_cache_tree": "/w/tree.json" }"#,
        )
        .unwrap();
        assert!(matches!(config.import_cache_tree, ImportCacheTree::File(_)));
    }

    #[test]
    fn test_overrides() {
        let mut doc: Value = serde_json::from_str(MINIMAL).unwrap();
        apply_overrides(&mut doc, "worker_port=6000,limits.mem_mb=128,sandbox=docker").unwrap();
        apply_overrides(&mut doc, "features.import_cache=off").unwrap();

        assert_eq!(doc["worker_port"], 6000);
        assert_eq!(doc["limits"]["mem_mb"], 128);
        assert_eq!(doc["sandbox"], "docker");

        let config = ConfigLoader::load_value(doc).unwrap();
        assert_eq!(config.worker_port.value(), 6000);
        assert_eq!(config.limits.mem_mb, 128);
        assert_eq!(config.features.import_cache, ImportCacheMode::Off);
    }

    #[test]
    fn test_bad_override() {
        let mut doc: Value = serde_json::from_str(MINIMAL).unwrap();
        assert!(apply_overrides(&mut doc, "no-equals-sign").is_err());
        assert!(apply_overrides(&mut doc, "=1").is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = WorkerConfig::with_worker_dir(dir.path().join("worker")).unwrap();
        let path = dir.path().join("config.json");
        config.save(&path).unwrap();

        let loaded = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(loaded.worker_dir, config.worker_dir);
        assert_eq!(loaded.mem_pool_mb, config.mem_pool_mb);
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/definitely/not/here.json");
        assert!(matches!(result, Err(WorkerError::ConfigNotFound { .. })));
    }
}
