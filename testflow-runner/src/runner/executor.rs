// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test executor interface and the worker loop that drives it.
//!
//! Each worker takes a permit from the concurrency gate, asks the scheduler
//! state for the next runnable test, and invokes the [`TestExecutor`] for it.
//! Results are sent to the dispatcher as [`ExecutorEvent`]s.

use super::{ExecutorEvent, RunId, state::SchedulerState};
use crate::{
    adaptive::{ConcurrencyGate, WorkerGauge},
    errors::{ExecutorError, ExecutorPanicError, TestError, TestFailedError, TestTimeoutError},
    list::{ExecutableTest, TestResult, TestState},
    reporter::SkipReason,
};
use futures::FutureExt;
use std::{any::Any, future::Future, panic::AssertUnwindSafe, pin::pin, time::Duration};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Runs individual tests on behalf of the scheduler.
///
/// The scheduler decides *when* a test runs; the executor decides *what*
/// running it means. One executor is shared by every worker, so
/// implementations must be safe to call concurrently.
///
/// An executor should honor [`ExecuteContext::cancellation_token`]: it fires
/// when the test times out or when the run is cancelled.
pub trait TestExecutor: Send + Sync {
    /// Runs `test` and reports its outcome.
    ///
    /// Returning an error or panicking fails the test. Neither affects other
    /// tests, except through dependencies.
    fn execute(
        &self,
        test: &ExecutableTest,
        cx: ExecuteContext,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutorError>> + Send;
}

/// Context passed to a [`TestExecutor`] for a single test.
#[derive(Clone, Debug)]
pub struct ExecuteContext {
    run_id: RunId,
    worker_id: usize,
    cancellation_token: CancellationToken,
    timeout: Duration,
}

impl ExecuteContext {
    /// Returns the ID of the current run.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Returns the index of the worker running this test.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Returns a token that fires when this test should stop.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Returns the timeout that applies to this test.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// The outcome of a test, as reported by a [`TestExecutor`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionResult {
    /// The test passed.
    Pass,

    /// The test failed.
    Fail {
        /// A description of the failure.
        message: String,
    },

    /// The executor decided not to run the test.
    Skip {
        /// Why the test was skipped.
        reason: String,
    },
}

impl ExecutionResult {
    /// Creates a failing result.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }

    /// Creates a skipped result.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }
}

/// Shared context for the worker tasks of a run.
#[derive(Debug)]
pub(super) struct ExecutorContext<'s, 'a, E> {
    executor: &'s E,
    run_id: RunId,
    default_timeout: Duration,
    state: &'s SchedulerState<'s, 'a>,
    gate: &'s ConcurrencyGate,
    gauge: &'s WorkerGauge,
    /// Fires when the run begins cancelling.
    run_token: CancellationToken,
    /// Fires when running tests should be dropped rather than awaited.
    terminate_token: CancellationToken,
}

impl<'s, 'a, E> ExecutorContext<'s, 'a, E>
where
    E: TestExecutor,
{
    #[expect(clippy::too_many_arguments)]
    pub(super) fn new(
        executor: &'s E,
        run_id: RunId,
        default_timeout: Duration,
        state: &'s SchedulerState<'s, 'a>,
        gate: &'s ConcurrencyGate,
        gauge: &'s WorkerGauge,
        run_token: CancellationToken,
        terminate_token: CancellationToken,
    ) -> Self {
        Self {
            executor,
            run_id,
            default_timeout,
            state,
            gate,
            gauge,
            run_token,
            terminate_token,
        }
    }

    /// Runs tests until there are none left, or until the run is cancelled.
    pub(super) async fn run_worker(
        &self,
        worker_id: usize,
        resp_tx: UnboundedSender<ExecutorEvent<'a>>,
    ) {
        let test_list = self.state.test_list();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.state.done().cancelled() => break,
                permit = self.gate.acquire() => match permit {
                    Ok(permit) => permit,
                    // The gate was closed.
                    Err(_) => break,
                },
            };
            let Some(ix) = self.state.next_test(worker_id).await else {
                break;
            };
            let test = test_list.by_index(ix);

            self.gauge.worker_busy();
            let _ = resp_tx.send(ExecutorEvent::Started { test, worker_id });

            let result = self.run_test(test, worker_id).await;
            let state = result.state;
            test.finish(result.clone());
            let _ = resp_tx.send(ExecutorEvent::Finished { test, result });

            for (test, reason) in self.state.complete(ix, state) {
                let _ = resp_tx.send(ExecutorEvent::Skipped { test, reason });
            }
            self.gauge.worker_idle();
            drop(permit);
        }

        debug!(worker_id, "worker exiting");
    }

    #[instrument(level = "debug", skip_all, fields(test = %test.id(), worker_id))]
    async fn run_test(&self, test: &'a ExecutableTest, worker_id: usize) -> TestResult {
        let timeout = test.timeout().unwrap_or(self.default_timeout);
        let test_token = self.run_token.child_token();
        let cx = ExecuteContext {
            run_id: self.run_id,
            worker_id,
            cancellation_token: test_token.clone(),
            timeout,
        };

        let stopwatch = crate::time::stopwatch();
        let fut = AssertUnwindSafe(self.executor.execute(test, cx)).catch_unwind();
        let outcome = tokio::time::timeout(timeout, self.drive(fut)).await;
        let snapshot = stopwatch.snapshot();

        let (state, error, skip_reason) = match outcome {
            Err(_) => {
                // Let a cooperative executor know that it should stop.
                test_token.cancel();
                if self.run_token.is_cancelled() {
                    // The test was still within its timeout when cancellation
                    // began.
                    debug!("timed out while the run was being cancelled");
                    return TestResult {
                        state: TestState::Cancelled,
                        start_time: Some(snapshot.start_time.fixed_offset()),
                        duration: snapshot.duration,
                        error: None,
                        skip_reason: None,
                    };
                }
                let error = TestTimeoutError::new(timeout);
                debug!("{error}");
                (TestState::Failed, Some(TestError::from(error)), None)
            }
            Ok(None) => (TestState::Cancelled, None, None),
            Ok(Some(Ok(Ok(ExecutionResult::Pass)))) => (TestState::Passed, None, None),
            Ok(Some(Ok(Ok(ExecutionResult::Fail { message })))) => (
                TestState::Failed,
                Some(TestFailedError::new(message).into()),
                None,
            ),
            Ok(Some(Ok(Ok(ExecutionResult::Skip { reason })))) => (
                TestState::Skipped,
                None,
                Some(SkipReason::Executor { reason }),
            ),
            Ok(Some(Ok(Err(error)))) => (TestState::Failed, Some(error.into()), None),
            Ok(Some(Err(panic))) => {
                let error = ExecutorPanicError::new(panic_message(panic.as_ref()));
                debug!("{error}");
                (TestState::Failed, Some(error.into()), None)
            }
        };

        TestResult {
            state,
            start_time: Some(snapshot.start_time.fixed_offset()),
            duration: snapshot.duration,
            error,
            skip_reason,
        }
    }

    /// Drives a test future, returning `None` if the run was cancelled before
    /// it completed.
    ///
    /// After cancellation begins the future keeps being polled until it
    /// completes or the terminate token fires, but its outcome is discarded.
    async fn drive<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        let mut fut = pin!(fut);
        tokio::select! {
            biased;
            // An outcome produced after cancellation began is a reaction to
            // it, not a result.
            res = &mut fut => return (!self.run_token.is_cancelled()).then_some(res),
            _ = self.run_token.cancelled() => {}
        }

        tokio::select! {
            biased;
            _ = &mut fut => {}
            _ = self.terminate_token.cancelled() => {
                debug!("dropping running test");
            }
        }
        None
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}
