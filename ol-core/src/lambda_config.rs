// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-lambda `ol.yaml` configuration.
//!
//! A missing file means defaults: one HTTP trigger accepting every method.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::PullError;

pub const LAMBDA_CONFIG_FILENAME: &str = "ol.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTrigger {
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTrigger {
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaTrigger {
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_offset_reset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpTrigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron: Vec<CronTrigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kafka: Vec<KafkaTrigger>,
}

/// Resource overrides for one lambda. Zero or absent fields fall back to the
/// worker's `limits`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LambdaLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LambdaConfig {
    #[serde(default)]
    pub triggers: Triggers,
    #[serde(default)]
    pub limits: LambdaLimits,
}

impl Default for LambdaConfig {
    fn default() -> Self {
        Self {
            triggers: Triggers {
                http: vec![HttpTrigger {
                    method: "*".to_string(),
                }],
                cron: Vec::new(),
                kafka: Vec::new(),
            },
            limits: LambdaLimits::default(),
        }
    }
}

impl LambdaConfig {
    /// Parse and validate YAML text.
    pub fn parse(yaml: &str) -> Result<Self, PullError> {
        let config: LambdaConfig =
            serde_yaml::from_str(yaml).map_err(|e| PullError::CodeInvalid {
                reason: format!("failed to parse {}: {}", LAMBDA_CONFIG_FILENAME, e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `ol.yaml` from an extracted code directory.
    pub fn load(code_dir: impl AsRef<Path>) -> Result<Self, PullError> {
        let path = code_dir.as_ref().join(LAMBDA_CONFIG_FILENAME);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(PullError::Io {
                context: "reading ol.yaml",
                source: e,
            }),
        }
    }

    fn validate(&self) -> Result<(), PullError> {
        let invalid = |reason: &str| {
            Err(PullError::CodeInvalid {
                reason: reason.to_string(),
            })
        };

        if self.triggers.http.iter().any(|t| t.method.is_empty()) {
            return invalid("HTTP trigger method cannot be empty");
        }
        if self.triggers.cron.iter().any(|t| t.schedule.is_empty()) {
            return invalid("cron trigger schedule cannot be empty");
        }
        for kafka in &self.triggers.kafka {
            if kafka.topics.is_empty() {
                return invalid("kafka trigger must have at least one topic");
            }
            if kafka.bootstrap_servers.is_empty() {
                return invalid("kafka trigger must specify at least one bootstrap server");
            }
            if kafka.group_id.is_empty() {
                return invalid("kafka trigger must have a group ID");
            }
        }
        Ok(())
    }

    pub fn is_http_method_allowed(&self, method: &str) -> bool {
        self.triggers
            .http
            .iter()
            .any(|t| t.method == "*" || t.method.eq_ignore_ascii_case(method))
    }

    pub fn allowed_http_methods(&self) -> Vec<String> {
        self.triggers.http.iter().map(|t| t.method.clone()).collect()
    }
}

/// Find and parse `ol.yaml` inside a gzip tarball stream.
///
/// A tarball without one yields the default config; a stream that is not a
/// valid gzip tar is `CodeInvalid`.
pub fn extract_config_from_tar_gz(reader: impl Read) -> Result<LambdaConfig, PullError> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive.entries().map_err(|e| PullError::CodeInvalid {
        reason: format!("invalid tar.gz: {}", e),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| PullError::CodeInvalid {
            reason: format!("invalid tar.gz: {}", e),
        })?;

        let is_config = entry
            .path()
            .map(|p| {
                p.strip_prefix("./").unwrap_or(p.as_ref()) == Path::new(LAMBDA_CONFIG_FILENAME)
            })
            .unwrap_or(false);

        if is_config {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| PullError::CodeInvalid {
                    reason: format!("unreadable {}: {}", LAMBDA_CONFIG_FILENAME, e),
                })?;
            return LambdaConfig::parse(&text);
        }
    }

    tracing::debug!("{} not found in tarball, using default config", LAMBDA_CONFIG_FILENAME);
    Ok(LambdaConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_default_allows_everything() {
        let config = LambdaConfig::default();
        assert!(config.is_http_method_allowed("GET"));
        assert!(config.is_http_method_allowed("DELETE"));
        assert_eq!(config.allowed_http_methods(), vec!["*"]);
    }

    #[test]
    fn test_parse_triggers() {
        let config = LambdaConfig::parse(
            r#"
triggers:
  http:
    - method: GET
    - method: POST
  cron:
    - schedule: "*/5 * * * *"
limits:
  mem_mb: 128
"#,
        )
        .unwrap();

        assert!(config.is_http_method_allowed("GET"));
        assert!(config.is_http_method_allowed("POST"));
        assert!(!config.is_http_method_allowed("PUT"));
        assert_eq!(config.allowed_http_methods(), vec!["GET", "POST"]);
        assert_eq!(config.triggers.cron.len(), 1);
        assert_eq!(config.limits.mem_mb, Some(128));
        assert_eq!(config.limits.runtime_sec, None);
    }

    #[test]
    fn test_validation() {
        assert!(LambdaConfig::parse("triggers:\n  http:\n    - method: \"\"\n").is_err());
        assert!(LambdaConfig::parse(
            "triggers:\n  kafka:\n    - topics: [a]\n      group_id: g\n"
        )
        .is_err());
        assert!(LambdaConfig::parse("triggers: [not, a, map]").is_err());
    }

    #[test]
    fn test_load_missing_file_uses_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(LambdaConfig::load(tmp.path()).unwrap(), LambdaConfig::default());
    }

    #[test]
    fn test_extract_from_tarball() {
        let data = tarball(&[
            ("f.py", "def f(event): return event\n"),
            ("ol.yaml", "triggers:\n  http:\n    - method: PUT\n"),
        ]);
        let config = extract_config_from_tar_gz(data.as_slice()).unwrap();
        assert_eq!(config.allowed_http_methods(), vec!["PUT"]);

        let data = tarball(&[("f.py", "")]);
        let config = extract_config_from_tar_gz(data.as_slice()).unwrap();
        assert_eq!(config, LambdaConfig::default());
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let result = extract_config_from_tar_gz(&b"not a tarball"[..]);
        assert!(matches!(result, Err(PullError::CodeInvalid { .. })));
    }
}
