// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::SystemMetrics;
use crate::config::{AdaptiveConfig, ThreadLimits};
use bytesize::ByteSize;
use std::{collections::VecDeque, fmt, time::Instant};

/// Which way the concurrency limit moves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdjustmentDirection {
    /// The limit goes up.
    Increase,

    /// The limit goes down.
    Decrease,

    /// The limit stays where it is.
    Hold,
}

impl fmt::Display for AdjustmentDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Why the adaptive controller made a decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AdjustmentReason {
    /// Nearly every worker is busy, or the ready queue is long.
    WorkerStarvation {
        /// The fraction of workers that are busy.
        utilization: f64,
        /// The number of ready tests waiting for a worker.
        pending: usize,
    },

    /// System CPU usage is high.
    HighCpu {
        /// CPU usage, in percent.
        cpu_percent: f64,
    },

    /// The process is using more memory than the configured ceiling.
    MemoryPressure {
        /// Resident memory, in bytes.
        memory_bytes: u64,
    },

    /// CPU and workers are both underused.
    ResourcesAvailable {
        /// CPU usage, in percent.
        cpu_percent: f64,
        /// The fraction of workers that are busy.
        utilization: f64,
    },

    /// Tests are finishing noticeably slower than before.
    CompletionRateDeclining {
        /// The relative change in completion rate. Negative means slower.
        change: f64,
    },

    /// Nothing calls for a change.
    Stable,
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerStarvation {
                utilization,
                pending,
            } => write!(
                f,
                "worker starvation (utilization: {:.1}%, pending: {pending})",
                utilization * 100.0
            ),
            Self::HighCpu { cpu_percent } => write!(f, "high CPU usage ({cpu_percent:.1}%)"),
            Self::MemoryPressure { memory_bytes } => {
                write!(f, "high memory usage ({})", ByteSize(*memory_bytes))
            }
            Self::ResourcesAvailable {
                cpu_percent,
                utilization,
            } => write!(
                f,
                "resources available (CPU: {cpu_percent:.1}%, utilization: {:.1}%)",
                utilization * 100.0
            ),
            Self::CompletionRateDeclining { change } => {
                write!(f, "completion rate declining ({:.1}%)", change * 100.0)
            }
            Self::Stable => write!(f, "system metrics stable"),
        }
    }
}

/// The outcome of a single adaptive decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdjustmentRecommendation {
    /// The recommended limit, always within the configured bounds.
    pub new_limit: usize,

    /// Which way the limit moves. This is [`AdjustmentDirection::Hold`]
    /// whenever `new_limit` equals the current limit.
    pub direction: AdjustmentDirection,

    /// Why.
    pub reason: AdjustmentReason,
}

/// Decides how the concurrency limit should change.
///
/// `completion_trend` is the relative change in completion rate reported by
/// [`CompletionRateTracker::trend`], or `None` if there isn't enough history.
///
/// In order:
///
/// 1. Decrease on worker starvation, high CPU, or memory pressure.
/// 2. Increase if CPU and workers are underused and the completion rate isn't
///    falling. Very low CPU scales the limit proportionally.
/// 3. Decrease if the completion rate is falling sharply.
/// 4. Otherwise hold.
pub fn recommend(
    metrics: &SystemMetrics,
    current: usize,
    completion_trend: Option<f64>,
    limits: &ThreadLimits,
    config: &AdaptiveConfig,
) -> AdjustmentRecommendation {
    let utilization = metrics.utilization();
    let cpu_percent = metrics.cpu_usage_percent;
    let trend = completion_trend.unwrap_or(0.0);

    let (direction, reason) = if utilization > config.thread_pool_high
        || metrics.pending_work_items > config.pending_work_limit
    {
        (
            AdjustmentDirection::Decrease,
            AdjustmentReason::WorkerStarvation {
                utilization,
                pending: metrics.pending_work_items,
            },
        )
    } else if cpu_percent > config.cpu_high {
        (
            AdjustmentDirection::Decrease,
            AdjustmentReason::HighCpu { cpu_percent },
        )
    } else if metrics.memory_bytes > config.memory_ceiling.as_u64() {
        (
            AdjustmentDirection::Decrease,
            AdjustmentReason::MemoryPressure {
                memory_bytes: metrics.memory_bytes,
            },
        )
    } else if cpu_percent < config.cpu_low
        && utilization < config.thread_pool_low
        && current < limits.max
        && trend >= 0.0
    {
        (
            AdjustmentDirection::Increase,
            AdjustmentReason::ResourcesAvailable {
                cpu_percent,
                utilization,
            },
        )
    } else if trend < -config.completion_decline {
        (
            AdjustmentDirection::Decrease,
            AdjustmentReason::CompletionRateDeclining { change: trend },
        )
    } else {
        (AdjustmentDirection::Hold, AdjustmentReason::Stable)
    };

    let new_limit = match direction {
        AdjustmentDirection::Increase => {
            if cpu_percent > 0.0 && cpu_percent < config.cpu_very_low {
                let scale = (config.cpu_target / cpu_percent).min(config.max_jump_factor);
                // Truncation can round a small scale back down to `current`.
                ((current as f64 * scale) as usize).max(current + 1)
            } else {
                current + step(current, config.increase_factor)
            }
        }
        AdjustmentDirection::Decrease => current.saturating_sub(step(current, config.decrease_factor)),
        AdjustmentDirection::Hold => current,
    }
    .clamp(limits.min, limits.max);

    AdjustmentRecommendation {
        new_limit,
        direction: if new_limit == current {
            AdjustmentDirection::Hold
        } else {
            direction
        },
        reason,
    }
}

fn step(current: usize, factor: f64) -> usize {
    ((current as f64 * factor) as usize).max(1)
}

/// Tracks how quickly tests complete over a sliding window.
#[derive(Clone, Debug)]
pub struct CompletionRateTracker {
    window: std::time::Duration,
    samples: VecDeque<(Instant, usize)>,
}

impl CompletionRateTracker {
    /// Creates a tracker over the given window.
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records the total number of completed tests at `now`.
    pub fn record(&mut self, now: Instant, completed: usize) {
        self.samples.push_back((now, completed));
        while let Some(&(oldest, _)) = self.samples.front() {
            if now.duration_since(oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the relative change in completion rate between the older and
    /// the newer half of the window.
    ///
    /// Returns `None` until there's at least half a window of history, and
    /// when nothing completed in the older half.
    pub fn trend(&self) -> Option<f64> {
        let &(first_at, first_count) = self.samples.front()?;
        let &(last_at, last_count) = self.samples.back()?;
        if last_at.duration_since(first_at) < self.window / 2 {
            return None;
        }

        let midpoint = first_at + last_at.duration_since(first_at) / 2;
        let &(mid_at, mid_count) = self
            .samples
            .iter()
            .find(|(at, _)| *at >= midpoint)?;

        let older = rate(first_at, first_count, mid_at, mid_count)?;
        let newer = rate(mid_at, mid_count, last_at, last_count)?;
        (older > 0.0).then(|| (newer - older) / older)
    }
}

fn rate(start: Instant, start_count: usize, end: Instant, end_count: usize) -> Option<f64> {
    let secs = end.duration_since(start).as_secs_f64();
    (secs > 0.0).then(|| end_count.saturating_sub(start_count) as f64 / secs)
}
