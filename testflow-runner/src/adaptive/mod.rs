// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adaptive parallelism.
//!
//! In adaptive mode, an [`AdaptiveController`] runs alongside the workers. On
//! a fixed interval it samples [`SystemMetrics`], asks [`recommend`] for a new
//! concurrency limit, and applies it to the [`ConcurrencyGate`] every worker
//! acquires a permit from before running a test.

mod controller;
mod gate;
mod metrics;
mod strategy;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod os;

#[cfg(all(unix, not(target_os = "linux")))]
#[path = "unix.rs"]
mod os;

#[cfg(not(unix))]
#[path = "fallback.rs"]
mod os;

pub use controller::*;
pub use gate::*;
pub(crate) use metrics::WorkerGauge;
pub use metrics::{MetricsSource, PoolSnapshot, SystemMetrics, SystemMetricsCollector};
pub use strategy::*;
