// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    adaptive::{AdjustmentDirection, AdjustmentReason},
    config::ThreadLimits,
    errors::{CircularDependencyError, TestError},
    list::{ExecutableTest, TestId, TestList, TestResult, TestState},
    runner::RunId,
};
use chrono::{DateTime, FixedOffset};
use std::{fmt, time::Duration};

/// A test event.
///
/// Events are produced by a [`TestScheduler`](crate::runner::TestScheduler)
/// and consumed by the callback passed to it.
#[derive(Clone, Debug)]
pub struct TestEvent<'a> {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind<'a>,
}

/// The kind of test event this is.
///
/// Forms part of [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind<'a> {
    /// The run started.
    RunStarted {
        /// The list of tests that will be run.
        test_list: &'a TestList,

        /// The unique ID for this run.
        run_id: RunId,

        /// The concurrency bounds for this run.
        thread_limits: ThreadLimits,
    },

    /// A test was failed while the plan was built, because it is part of a
    /// dependency cycle. It never runs.
    TestPlanFailed {
        /// The test that failed.
        test: &'a ExecutableTest,

        /// The cycle the test is part of.
        error: CircularDependencyError,

        /// Current run statistics so far.
        current_stats: RunStats,
    },

    /// A test started running.
    TestStarted {
        /// The test that was started.
        test: &'a ExecutableTest,

        /// The index of the worker running the test.
        worker_id: usize,

        /// Current run statistics so far.
        current_stats: RunStats,

        /// The number of tests currently running, including this one.
        running: usize,

        /// The cancel status of the run. This is None if the run is still ongoing.
        cancel_state: Option<CancelReason>,
    },

    /// A test finished running.
    ///
    /// The result's state is one of passed, failed, skipped (as decided by the
    /// executor) or cancelled.
    TestFinished {
        /// The test that finished running.
        test: &'a ExecutableTest,

        /// The final result.
        result: TestResult,

        /// Current statistics for number of tests so far.
        current_stats: RunStats,

        /// The number of tests that are currently running, excluding this one.
        running: usize,

        /// The cancel status of the run. This is None if the run is still ongoing.
        cancel_state: Option<CancelReason>,
    },

    /// A test was skipped without running, because one of its dependencies
    /// didn't pass.
    TestSkipped {
        /// The test that was skipped.
        test: &'a ExecutableTest,

        /// The reason this test was skipped.
        reason: SkipReason,
    },

    /// A test was cancelled before it could start.
    TestCancelled {
        /// The test that was cancelled.
        test: &'a ExecutableTest,
    },

    /// The adaptive controller changed the concurrency limit.
    ParallelismAdjusted {
        /// The limit before the change.
        previous: usize,

        /// The limit after the change.
        current: usize,

        /// Whether the limit went up or down.
        direction: AdjustmentDirection,

        /// Why the limit changed.
        reason: AdjustmentReason,
    },

    /// Tests are running, but none has finished for the configured stall
    /// timeout.
    RunStalled {
        /// The tests currently running.
        running: Vec<&'a TestId>,

        /// How long it has been since the last test finished.
        since_last_progress: Duration,
    },

    /// A cancellation notice was received.
    RunBeginCancel {
        /// The number of tests still running.
        running: usize,

        /// The reason this run was cancelled.
        reason: CancelReason,
    },

    /// The run finished.
    RunFinished {
        /// The unique ID for this run.
        run_id: RunId,

        /// The time at which the run was started.
        start_time: DateTime<FixedOffset>,

        /// The amount of time it took for the tests to run.
        elapsed: Duration,

        /// Statistics for the run.
        run_stats: RunStats,
    },
}

/// Statistics for a run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of tests that were expected to be run at the beginning.
    ///
    /// If the run is cancelled, this will be more than `finished_count` at the
    /// end unless every remaining test is accounted for as cancelled.
    pub initial_run_count: usize,

    /// The total number of tests that reached a terminal state.
    pub finished_count: usize,

    /// The number of tests that passed.
    pub passed: usize,

    /// The number of tests that failed, either as reported by the executor or
    /// because they are part of a dependency cycle.
    pub failed: usize,

    /// The number of tests that timed out.
    pub timed_out: usize,

    /// The number of tests whose executor returned an error or panicked.
    pub exec_failed: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,

    /// The number of tests that were cancelled.
    pub cancelled: usize,
}

impl RunStats {
    /// Returns true if this run is considered a success.
    ///
    /// A run is a failure if any tests failed, timed out or hit an executor
    /// error, or if it was cancelled before every test finished.
    pub fn is_success(&self) -> bool {
        if self.initial_run_count > self.finished_count || self.cancelled > 0 {
            return false;
        }
        !self.any_failed()
    }

    /// Returns true if any tests failed or were timed out.
    #[inline]
    pub fn any_failed(&self) -> bool {
        self.failed_count() > 0
    }

    /// Returns the total number of failures, for max-fail purposes.
    pub fn failed_count(&self) -> usize {
        self.failed + self.exec_failed + self.timed_out
    }

    pub(crate) fn on_test_finished(&mut self, result: &TestResult) {
        self.finished_count += 1;
        match result.state {
            TestState::Passed => self.passed += 1,
            TestState::Failed => match result.error {
                Some(TestError::Timeout(_)) => self.timed_out += 1,
                Some(TestError::Executor(_) | TestError::Panic(_)) => self.exec_failed += 1,
                Some(TestError::CircularDependency(_) | TestError::Failed(_)) | None => {
                    self.failed += 1
                }
            },
            TestState::Skipped => self.skipped += 1,
            TestState::Cancelled => self.cancelled += 1,
            TestState::NotStarted | TestState::Ready | TestState::Running => {
                unreachable!("on_test_finished is only called with terminal states")
            }
        }
    }
}

// Note: the order here matters -- it indicates severity of cancellation
/// The reason why a run is being cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// The max-fail limit was reached.
    TestFailure,

    /// The reporting callback returned an error.
    ReportError,

    /// The caller's cancellation token was triggered.
    External,
}

impl CancelReason {
    pub(crate) fn to_static_str(self) -> &'static str {
        match self {
            CancelReason::TestFailure => "test failure",
            CancelReason::ReportError => "reporting error",
            CancelReason::External => "external cancellation",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// The reason a test was skipped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// A dependency ended in a state other than passed, and the dependency
    /// edge doesn't allow proceeding on failure.
    DependencyFailed {
        /// The dependency that didn't pass.
        dependency: TestId,

        /// The state that dependency ended in.
        state: TestState,
    },

    /// The executor chose to skip the test.
    Executor {
        /// The reason given by the executor.
        reason: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { dependency, state } => {
                write!(f, "dependency `{dependency}` {state}")
            }
            Self::Executor { reason } => write!(f, "skipped by executor: {reason}"),
        }
    }
}
