// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The execution core of a test runner.
//!
//! Given a [`TestList`](list::TestList) of units with declared dependencies,
//! mutual-exclusion constraints and priorities, the scheduler in [`runner`]
//! executes every unit exactly once. It honors ordering and exclusion rules,
//! keeps as many units in flight as the concurrency gate allows, and (in
//! adaptive mode) resizes that gate based on live system load.
//!
//! The basic flow is:
//!
//! 1. [`plan::ExecutionPlan`] builds the dependency graph, fails tests that are
//!    part of a cycle, and ranks the rest topologically.
//! 2. [`classify::ConstraintPartitions`] splits the executable tests by
//!    constraint class.
//! 3. [`runner::TestScheduler`] runs a pool of workers over the ready queues,
//!    acquiring constraint locks atomically and invoking a
//!    [`runner::TestExecutor`] for each test.
//! 4. [`adaptive`] optionally samples system metrics and adjusts the
//!    concurrency limit while the run is in progress.

pub mod adaptive;
pub mod classify;
pub mod config;
pub mod errors;
pub mod list;
pub mod plan;
pub mod reporter;
pub mod runner;
mod time;
mod work_queue;
