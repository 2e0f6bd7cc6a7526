// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

/// A point-in-time sample of system load.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemMetrics {
    /// System-wide CPU usage, in percent. Zero where unavailable.
    pub cpu_usage_percent: f64,

    /// Workers not currently running a test.
    pub available_workers: usize,

    /// The size of the worker pool.
    pub max_workers: usize,

    /// Ready tests waiting for a worker.
    pub pending_work_items: usize,

    /// Resident memory of this process, in bytes. Zero where unavailable.
    pub memory_bytes: u64,

    /// Tests completed so far in this run.
    pub completed_work_items: usize,
}

impl SystemMetrics {
    /// Returns the fraction of workers that are busy, from 0 to 1.
    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            return 0.0;
        }
        1.0 - self.available_workers as f64 / self.max_workers as f64
    }
}

/// Worker pool counters, as seen by a [`MetricsSource`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolSnapshot {
    /// Workers not currently running a test.
    pub available_workers: usize,

    /// The size of the worker pool.
    pub max_workers: usize,

    /// Ready tests waiting for a worker.
    pub pending_work_items: usize,

    /// Tests completed so far in this run.
    pub completed_work_items: usize,
}

/// A source of [`SystemMetrics`] for the adaptive controller.
///
/// The default is [`SystemMetricsCollector`]. Tests and embedders can supply
/// their own.
pub trait MetricsSource: Send {
    /// Takes a sample. `pool` holds the scheduler's own counters.
    fn sample(&mut self, pool: PoolSnapshot) -> SystemMetrics;
}

impl<M: MetricsSource + ?Sized> MetricsSource for Box<M> {
    fn sample(&mut self, pool: PoolSnapshot) -> SystemMetrics {
        (**self).sample(pool)
    }
}

/// Live counters for the worker pool, updated by the scheduler.
#[derive(Debug)]
pub(crate) struct WorkerGauge {
    max_workers: usize,
    busy: AtomicUsize,
    pending: AtomicUsize,
    completed: AtomicUsize,
}

impl WorkerGauge {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            busy: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn worker_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_idle(&self) {
        self.busy.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::Relaxed);
    }

    pub(crate) fn set_completed(&self, completed: usize) {
        self.completed.store(completed, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        let busy = self.busy.load(Ordering::Relaxed);
        PoolSnapshot {
            available_workers: self.max_workers.saturating_sub(busy),
            max_workers: self.max_workers,
            pending_work_items: self.pending.load(Ordering::Relaxed),
            completed_work_items: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Samples CPU and memory from the operating system.
///
/// On Linux, CPU usage is computed from `/proc/stat` deltas between samples,
/// so the first sample reports zero. On other Unix platforms it's the
/// one-minute load average relative to the CPU count. Elsewhere both CPU and
/// memory read as zero.
#[derive(Debug, Default)]
pub struct SystemMetricsCollector {
    cpu: super::os::CpuSampler,
}

impl SystemMetricsCollector {
    /// Creates a new collector.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSource for SystemMetricsCollector {
    fn sample(&mut self, pool: PoolSnapshot) -> SystemMetrics {
        SystemMetrics {
            cpu_usage_percent: self.cpu.sample().unwrap_or(0.0).clamp(0.0, 100.0),
            available_workers: pool.available_workers,
            max_workers: pool.max_workers,
            pending_work_items: pool.pending_work_items,
            memory_bytes: super::os::resident_memory().unwrap_or(0),
            completed_work_items: pool.completed_work_items,
        }
    }
}
