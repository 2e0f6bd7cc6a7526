// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for the scheduler.
//!
//! Loading configuration is the job of the embedding application. This module
//! provides the typed model it deserializes into, layered on top of an
//! embedded set of defaults: see [`SchedulerConfig`].
//!
//! Per-test settings ([`Constraint`], [`TestPriority`]) live here as well,
//! since they share the parsing and display conventions of the run-wide
//! settings.

mod core;
mod elements;

pub use core::*;
pub use elements::*;
