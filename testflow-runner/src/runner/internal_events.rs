// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These events mirror some of those in [`crate::reporter::events`], but are
//! used within the runner. The dispatcher turns them into reporter events and
//! keeps the run statistics.

use crate::{
    adaptive::ParallelismChange,
    list::{ExecutableTest, TestResult},
    reporter::SkipReason,
};

/// An internal event.
///
/// These events are sent by the workers and the adaptive controller to the
/// dispatcher.
#[derive(Debug)]
pub(super) enum ExecutorEvent<'a> {
    Started {
        test: &'a ExecutableTest,
        worker_id: usize,
    },
    Finished {
        test: &'a ExecutableTest,
        result: TestResult,
    },
    Skipped {
        test: &'a ExecutableTest,
        reason: SkipReason,
    },
    ParallelismAdjusted(ParallelismChange),
}

/// An event handled by the dispatcher.
#[derive(Debug)]
pub(super) enum InternalEvent<'a> {
    Executor(ExecutorEvent<'a>),
    /// The caller's cancellation token fired.
    Cancel,
    /// The reporting callback failed.
    ReportCancel,
    /// No test has finished for the stall timeout.
    Stalled,
}
