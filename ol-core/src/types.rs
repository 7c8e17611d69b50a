// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Each type checks its invariants at construction, so downstream code can
//! take a `FunctionName` or `PackageName` and skip re-validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HardValidationError, PullError};

/// Validated function name: non-empty, `[A-Za-z0-9._-]+`.
///
/// The name doubles as a blob key prefix and a directory suffix, so path
/// separators and anything shell-significant are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionName(String);

impl FunctionName {
    /// Create a new FunctionName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, PullError> {
        let name = name.into();

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');

        // "." and ".." match the character class but name directories
        if !valid || name == "." || name == ".." {
            return Err(PullError::BadName { name });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for FunctionName {
    type Error = PullError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FunctionName> for String {
    fn from(name: FunctionName) -> Self {
        name.0
    }
}

/// Normalized package name.
///
/// Distribution names compare case-insensitively with `-` and `_`
/// equivalent, so the normalized form is lowercase with hyphens.
/// A `==version` pin is kept as part of the name; use [`PackageName::base`]
/// for the unpinned project name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_lowercase().replace('_', "-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Project name without any `==version` pin.
    pub fn base(&self) -> &str {
        self.0.split("==").next().unwrap_or(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        Self::normalize(value)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

/// Sandbox identifier, unique for the life of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SandboxId(u64);

impl SandboxId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SB-{}", self.0)
    }
}

/// Language runtime a sandbox boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Interpreter runtime started from `bootstrap.py` (`f.py` lambdas).
    Python,
    /// Prebuilt binary runtime (`f.bin` lambdas).
    Native,
}

impl RuntimeKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Native => "native",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Validated network port.
/// Must be in range 1-65535 (0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(u16);

impl Port {
    pub fn new(port: u16) -> Result<Self, HardValidationError> {
        if port == 0 {
            return Err(HardValidationError::InvalidPort {
                port,
                reason: "Port 0 is reserved and cannot be used".to_string(),
            });
        }
        Ok(Self(port))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for Port {
    type Error = HardValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_valid() {
        assert!(FunctionName::new("echo").is_ok());
        assert!(FunctionName::new("my_func-2.v1").is_ok());
        assert!(FunctionName::new("A").is_ok());
    }

    #[test]
    fn test_function_name_invalid() {
        assert!(FunctionName::new("").is_err());
        assert!(FunctionName::new("a/b").is_err());
        assert!(FunctionName::new("..").is_err());
        assert!(FunctionName::new("has space").is_err());
        assert!(FunctionName::new("semi;colon").is_err());
    }

    #[test]
    fn test_function_name_serde() {
        let name: FunctionName = serde_json::from_str("\"echo\"").unwrap();
        assert_eq!(name.as_str(), "echo");
        assert!(serde_json::from_str::<FunctionName>("\"../x\"").is_err());
    }

    #[test]
    fn test_package_normalization() {
        assert_eq!(PackageName::normalize("Requests").as_str(), "requests");
        assert_eq!(PackageName::normalize("typing_extensions").as_str(), "typing-extensions");
        assert_eq!(PackageName::normalize("Flask==2.0.1").base(), "flask");
        assert_eq!(PackageName::normalize("numpy").base(), "numpy");
    }

    #[test]
    fn test_sandbox_id_display() {
        assert_eq!(SandboxId::new(42).to_string(), "SB-42");
    }

    #[test]
    fn test_port_validation() {
        assert!(Port::new(5000).is_ok());
        assert!(Port::new(0).is_err());
    }
}
