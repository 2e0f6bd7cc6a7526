// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AdjustmentRecommendation, CompletionRateTracker, ConcurrencyGate, MetricsSource, PoolSnapshot,
    SystemMetrics, WorkerGauge, recommend,
};
use crate::config::{AdaptiveConfig, ThreadLimits};
use bytesize::ByteSize;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A change to the concurrency limit made by the [`AdaptiveController`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParallelismChange {
    /// The limit before the change.
    pub previous: usize,

    /// The decision that caused the change.
    pub recommendation: AdjustmentRecommendation,

    /// The metrics the decision was based on.
    pub metrics: SystemMetrics,
}

/// Periodically samples metrics and resizes a [`ConcurrencyGate`].
#[derive(Debug)]
pub struct AdaptiveController<M> {
    source: M,
    config: AdaptiveConfig,
    limits: ThreadLimits,
    tracker: CompletionRateTracker,
    metrics_logging: bool,
    last_summary: Option<Instant>,
}

impl<M: MetricsSource> AdaptiveController<M> {
    /// Creates a new controller.
    ///
    /// With `metrics_logging` set, every change and a periodic metrics summary
    /// are logged at info level. Otherwise changes are logged at debug level.
    pub fn new(
        source: M,
        config: AdaptiveConfig,
        limits: ThreadLimits,
        metrics_logging: bool,
    ) -> Self {
        let tracker = CompletionRateTracker::new(config.completion_window);
        Self {
            source,
            config,
            limits,
            tracker,
            metrics_logging,
            last_summary: None,
        }
    }

    /// Samples metrics once and applies the resulting recommendation to
    /// `gate`.
    ///
    /// Returns the change, if the limit moved.
    pub fn step(
        &mut self,
        gate: &ConcurrencyGate,
        pool: PoolSnapshot,
        now: Instant,
    ) -> Option<ParallelismChange> {
        let metrics = self.source.sample(pool);
        self.tracker.record(now, metrics.completed_work_items);
        let current = gate.limit();

        if self.metrics_logging && self.summary_due(now) {
            self.last_summary = Some(now);
            info!(
                limit = current,
                available_permits = gate.available(),
                cpu = format_args!("{:.1}%", metrics.cpu_usage_percent),
                workers = format_args!("{}/{}", metrics.available_workers, metrics.max_workers),
                pending = metrics.pending_work_items,
                memory = %ByteSize(metrics.memory_bytes),
                "adaptive metrics",
            );
        }

        let recommendation = recommend(
            &metrics,
            current,
            self.tracker.trend(),
            &self.limits,
            &self.config,
        );
        if recommendation.new_limit == current {
            return None;
        }

        gate.set_limit(recommendation.new_limit);
        if self.metrics_logging {
            info!(
                previous = current,
                new = recommendation.new_limit,
                direction = %recommendation.direction,
                reason = %recommendation.reason,
                "parallelism adjusted",
            );
        } else {
            debug!(
                previous = current,
                new = recommendation.new_limit,
                reason = %recommendation.reason,
                "parallelism adjusted",
            );
        }

        Some(ParallelismChange {
            previous: current,
            recommendation,
            metrics,
        })
    }

    /// Runs the controller on its configured interval until `done` fires.
    pub(crate) async fn run(
        mut self,
        gate: &ConcurrencyGate,
        gauge: &WorkerGauge,
        done: &CancellationToken,
        mut on_change: impl FnMut(ParallelismChange),
    ) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately. Skip it so that the first
        // sample has some history behind it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(change) = self.step(gate, gauge.snapshot(), Instant::now()) {
                        on_change(change);
                    }
                }
            }
        }
        debug!(final_limit = gate.limit(), "adaptive controller stopped");
    }

    fn summary_due(&self, now: Instant) -> bool {
        self.last_summary
            .is_none_or(|last| now.duration_since(last) >= self.config.metrics_log_interval)
    }
}
