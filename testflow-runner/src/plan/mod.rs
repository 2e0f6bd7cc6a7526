// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency analysis for a run.
//!
//! The main structure in this module is [`ExecutionPlan`].

mod imp;

pub use imp::*;
