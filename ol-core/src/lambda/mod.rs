// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lambda functions and the manager that routes invocations to them.

mod autoscaler;
mod function;
mod manager;

pub use autoscaler::{Autoscaler, SCALE_INTERVAL};
pub use function::{parse_requirements, FunctionStats, LambdaFunc};
pub use manager::FunctionManager;
