// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytesize::ByteSize;
use serde::Deserialize;
use std::time::Duration;

/// Whether the concurrency limit stays fixed or follows system load.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    /// The limit stays at `test-threads` for the whole run.
    #[default]
    Fixed,

    /// The limit starts at `test-threads` and is adjusted between
    /// `min-threads` and `max-threads`.
    Adaptive,
}

/// Tuning for the adaptive parallelism controller.
///
/// None of these values are load-bearing: they are starting points that work
/// for typical suites.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdaptiveConfig {
    /// How often metrics are sampled and the limit reconsidered.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Below this CPU percentage the limit may grow.
    pub cpu_low: f64,

    /// Above this CPU percentage the limit shrinks.
    pub cpu_high: f64,

    /// Below this CPU percentage, growth is proportional rather than stepped.
    pub cpu_very_low: f64,

    /// The CPU percentage that proportional growth aims for.
    pub cpu_target: f64,

    /// Below this worker utilization (0 to 1) the limit may grow.
    pub thread_pool_low: f64,

    /// Above this worker utilization (0 to 1) the pool is considered starved.
    pub thread_pool_high: f64,

    /// Above this many queued runtime tasks the pool is considered starved.
    pub pending_work_limit: usize,

    /// Above this resident set size the limit shrinks.
    pub memory_ceiling: ByteSize,

    /// Fraction of the current limit added on each increase.
    pub increase_factor: f64,

    /// Fraction of the current limit removed on each decrease.
    pub decrease_factor: f64,

    /// Cap on the multiplier applied by a proportional increase.
    pub max_jump_factor: f64,

    /// The window over which the completion rate trend is measured.
    #[serde(with = "humantime_serde")]
    pub completion_window: Duration,

    /// A completion rate drop larger than this fraction triggers a decrease.
    pub completion_decline: f64,

    /// How often a metrics summary is logged when metrics logging is on.
    #[serde(with = "humantime_serde")]
    pub metrics_log_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            cpu_low: 70.0,
            cpu_high: 90.0,
            cpu_very_low: 10.0,
            cpu_target: 60.0,
            thread_pool_low: 0.7,
            thread_pool_high: 0.9,
            pending_work_limit: 100,
            memory_ceiling: ByteSize::gib(1),
            increase_factor: 0.25,
            decrease_factor: 0.15,
            max_jump_factor: 3.0,
            completion_window: Duration::from_secs(10),
            completion_decline: 0.2,
            metrics_log_interval: Duration::from_secs(3),
        }
    }
}
