// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Language packages shared read-only by sandboxes under `/packages`.

mod dep_tracer;
mod installer;

pub use dep_tracer::DepTracer;
pub use installer::{Package, PackageInstaller, PackageMeta, PIP_INSTALL_LAMBDA};
