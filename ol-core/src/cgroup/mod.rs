// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! cgroup v2 resource control.
//!
//! Layout: `<cgroup_root>/<pool>/cg-<n>/`. Every sandbox holds one node
//! exclusively from creation until it is Dead.

#[allow(clippy::module_inception)]
mod cgroup;
mod pool;

pub use cgroup::Cgroup;
pub use pool::{CgroupPool, CGROUP_RESERVE};
