// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the scheduler.
//!
//! This module interfaces with the outside world and the workers. It receives
//! events from the workers, the adaptive controller and the caller's
//! cancellation token, keeps the run statistics, and sends events to the
//! reporting callback.

use super::{ExecutorEvent, InternalEvent, RunId, state::SchedulerState};
use crate::{
    config::{MaxFail, TerminateMode, ThreadLimits},
    errors::TestError,
    list::{ExecutableTest, TestId, TestList, TestResult, TestState},
    reporter::{CancelReason, RunStats, SkipReason, TestEvent, TestEventKind},
    time::StopwatchStart,
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::{collections::BTreeMap, pin::pin, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Context for the dispatcher.
///
/// This struct is responsible for coordinating events from the outside world
/// and communicating with the workers.
#[derive_where::derive_where(Debug)]
pub(super) struct DispatcherContext<'a, F> {
    callback: DebugIgnore<F>,
    run_id: RunId,
    stopwatch: StopwatchStart,
    run_stats: RunStats,
    max_fail: MaxFail,
    stall_timeout: Duration,
    running_tests: BTreeMap<&'a TestId, &'a ExecutableTest>,
    last_progress: Instant,
    stall_reported: bool,
    cancel_state: Option<CancelReason>,
}

/// The tokens the dispatcher fires when cancelling.
#[derive(Debug)]
pub(super) struct CancelTokens<'t> {
    /// The caller's token. Watched, never fired.
    pub(super) external: &'t CancellationToken,
    /// Fires when the run begins cancelling.
    pub(super) run: &'t CancellationToken,
    /// Fires when running tests should be dropped.
    pub(super) terminate: &'t CancellationToken,
}

impl<'a, F> DispatcherContext<'a, F>
where
    F: FnMut(TestEvent<'a>) + Send,
{
    pub(super) fn new(
        callback: F,
        run_id: RunId,
        initial_run_count: usize,
        max_fail: MaxFail,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            callback: DebugIgnore(callback),
            run_id,
            stopwatch: crate::time::stopwatch(),
            run_stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            max_fail,
            stall_timeout,
            running_tests: BTreeMap::new(),
            last_progress: Instant::now(),
            stall_reported: false,
            cancel_state: None,
        }
    }

    /// Runs the dispatcher to completion, until `executor_rx` is closed.
    ///
    /// `executor_rx` is closed once every worker and the adaptive controller
    /// have exited.
    ///
    /// This is expected to be spawned as a task via [`async_scoped`].
    pub(super) async fn run(
        &mut self,
        mut executor_rx: UnboundedReceiver<ExecutorEvent<'a>>,
        state: &SchedulerState<'_, 'a>,
        report_cancel_rx: oneshot::Receiver<()>,
        tokens: CancelTokens<'_>,
    ) {
        let mut report_cancel_rx = pin!(report_cancel_rx);
        let mut report_cancel_rx_done = false;

        loop {
            let stall_deadline = self.stall_deadline();
            let internal_event = tokio::select! {
                internal_event = executor_rx.recv() => {
                    match internal_event {
                        Some(event) => InternalEvent::Executor(event),
                        None => {
                            // All workers have exited.
                            break;
                        }
                    }
                },
                _ = tokens.external.cancelled(),
                    if self.cancel_state < Some(CancelReason::External) => {
                    InternalEvent::Cancel
                },
                res = &mut report_cancel_rx, if !report_cancel_rx_done => {
                    report_cancel_rx_done = true;
                    match res {
                        Ok(()) => InternalEvent::ReportCancel,
                        Err(_) => {
                            // The sender is dropped without sending at the end
                            // of a run that never failed to report.
                            continue;
                        }
                    }
                },
                // The deadline is only meaningful when the branch is enabled,
                // but the expression is evaluated either way.
                _ = tokio::time::sleep_until(stall_deadline.unwrap_or_else(Instant::now)),
                    if stall_deadline.is_some() => {
                    InternalEvent::Stalled
                },
            };

            match self.handle_event(internal_event) {
                HandleEventResponse::Cancel(mode) => {
                    tokens.run.cancel();
                    if mode == TerminateMode::Immediate {
                        tokens.terminate.cancel();
                    }
                    for test in state.cancel_pending() {
                        self.test_cancelled(test);
                    }
                }
                HandleEventResponse::None => {}
            }
        }
    }

    pub(super) fn run_started(&mut self, test_list: &'a TestList, thread_limits: ThreadLimits) {
        self.basic_callback(TestEventKind::RunStarted {
            test_list,
            run_id: self.run_id,
            thread_limits,
        })
    }

    /// Reports a test that was failed while the plan was built.
    pub(super) fn plan_failed(&mut self, test: &'a ExecutableTest) {
        let Some(result) = test.result() else {
            return;
        };
        let Some(TestError::CircularDependency(error)) = result.error.clone() else {
            return;
        };
        self.run_stats.on_test_finished(&result);
        self.basic_callback(TestEventKind::TestPlanFailed {
            test,
            error,
            current_stats: self.run_stats,
        })
    }

    /// Reports a test that was skipped because a dependency didn't pass.
    pub(super) fn test_skipped(&mut self, test: &'a ExecutableTest, reason: SkipReason) {
        self.run_stats
            .on_test_finished(&TestResult::not_run(TestState::Skipped));
        self.basic_callback(TestEventKind::TestSkipped { test, reason })
    }

    fn test_cancelled(&mut self, test: &'a ExecutableTest) {
        self.run_stats
            .on_test_finished(&TestResult::not_run(TestState::Cancelled));
        self.basic_callback(TestEventKind::TestCancelled { test })
    }

    #[inline]
    fn basic_callback(&mut self, kind: TestEventKind<'a>) {
        let snapshot = self.stopwatch.snapshot();
        let event = TestEvent {
            // Local::now() isn't monotonic, but the elapsed time is.
            timestamp: Local::now().fixed_offset(),
            elapsed: snapshot.duration,
            kind,
        };
        (self.callback)(event)
    }

    #[inline]
    fn callback_none_response(&mut self, kind: TestEventKind<'a>) -> HandleEventResponse {
        self.basic_callback(kind);
        HandleEventResponse::None
    }

    fn handle_event(&mut self, event: InternalEvent<'a>) -> HandleEventResponse {
        match event {
            InternalEvent::Executor(ExecutorEvent::Started { test, worker_id }) => {
                if self.running_tests.is_empty() {
                    // Stall detection measures time with something running.
                    self.last_progress = Instant::now();
                }
                self.running_tests.insert(test.id(), test);
                self.callback_none_response(TestEventKind::TestStarted {
                    test,
                    worker_id,
                    current_stats: self.run_stats,
                    running: self.running_tests.len(),
                    cancel_state: self.cancel_state,
                })
            }
            InternalEvent::Executor(ExecutorEvent::Finished { test, result }) => {
                self.running_tests.remove(test.id());
                self.last_progress = Instant::now();
                self.stall_reported = false;
                self.run_stats.on_test_finished(&result);

                self.basic_callback(TestEventKind::TestFinished {
                    test,
                    result,
                    current_stats: self.run_stats,
                    running: self.running_tests.len(),
                    cancel_state: self.cancel_state,
                });

                match self.max_fail.is_exceeded(self.run_stats.failed_count()) {
                    Some(mode) => self.begin_cancel(CancelReason::TestFailure, mode),
                    None => HandleEventResponse::None,
                }
            }
            InternalEvent::Executor(ExecutorEvent::Skipped { test, reason }) => {
                self.test_skipped(test, reason);
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::ParallelismAdjusted(change)) => {
                self.callback_none_response(TestEventKind::ParallelismAdjusted {
                    previous: change.previous,
                    current: change.recommendation.new_limit,
                    direction: change.recommendation.direction,
                    reason: change.recommendation.reason,
                })
            }
            InternalEvent::Cancel => {
                self.begin_cancel(CancelReason::External, TerminateMode::Wait)
            }
            InternalEvent::ReportCancel => {
                self.begin_cancel(CancelReason::ReportError, TerminateMode::Wait)
            }
            InternalEvent::Stalled => {
                let since_last_progress = self.last_progress.elapsed();
                self.stall_reported = true;
                warn!(
                    running = self.running_tests.len(),
                    "no test has finished for {:?}",
                    since_last_progress,
                );
                self.callback_none_response(TestEventKind::RunStalled {
                    running: self.running_tests.keys().copied().collect(),
                    since_last_progress,
                })
            }
        }
    }

    /// Begins cancellation of a test run, if it hasn't already been cancelled
    /// for a reason at least as severe.
    fn begin_cancel(&mut self, reason: CancelReason, mode: TerminateMode) -> HandleEventResponse {
        if self.cancel_state < Some(reason) {
            debug!(%reason, %mode, "beginning cancellation");
            self.cancel_state = Some(reason);
            self.basic_callback(TestEventKind::RunBeginCancel {
                running: self.running_tests.len(),
                reason,
            });
            HandleEventResponse::Cancel(mode)
        } else {
            HandleEventResponse::None
        }
    }

    /// When a stall should be reported, if stall detection applies right now.
    fn stall_deadline(&self) -> Option<Instant> {
        (!self.stall_timeout.is_zero() && !self.stall_reported && !self.running_tests.is_empty())
            .then(|| self.last_progress + self.stall_timeout)
    }

    pub(super) fn run_finished(&mut self) {
        let stopwatch_end = self.stopwatch.snapshot();
        self.basic_callback(TestEventKind::RunFinished {
            start_time: stopwatch_end.start_time.fixed_offset(),
            run_id: self.run_id,
            elapsed: stopwatch_end.duration,
            run_stats: self.run_stats,
        })
    }

    pub(super) fn run_stats(&self) -> RunStats {
        self.run_stats
    }
}

#[derive(Debug, PartialEq, Eq)]
enum HandleEventResponse {
    None,
    Cancel(TerminateMode),
}
