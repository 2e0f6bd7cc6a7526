// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    DispatcherContext, ExecutorEvent, TestExecutor,
    dispatcher::CancelTokens,
    executor::ExecutorContext,
    state::SchedulerState,
};
use crate::{
    adaptive::{
        AdaptiveController, ConcurrencyGate, MetricsSource, SystemMetricsCollector, WorkerGauge,
    },
    classify::ConstraintPartitions,
    config::{
        AdaptiveConfig, MaxFail, SchedulerConfig, SchedulingStrategy, TestThreads, ThreadLimits,
    },
    errors::{SchedulerBuildError, SchedulerExecuteErrors},
    list::TestList,
    plan::ExecutionPlan,
    reporter::{RunStats, TestEvent},
};
use async_scoped::TokioScope;
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use std::{convert::Infallible, fmt, time::Duration};
use tokio::{
    runtime::Runtime,
    sync::{mpsc::unbounded_channel, oneshot},
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The kind for [`RunId`].
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("run");
        TAG
    }
}

/// The unique ID of a run.
pub type RunId = TypedUuid<RunKind>;

/// Scheduler options.
///
/// Starts from a [`SchedulerConfig`]; individual settings can then be
/// overridden.
#[derive(Default)]
pub struct TestSchedulerBuilder {
    config: SchedulerConfig,
    strategy: Option<SchedulingStrategy>,
    test_threads: Option<TestThreads>,
    thread_limits: Option<ThreadLimits>,
    test_timeout: Option<Duration>,
    stall_timeout: Option<Duration>,
    max_fail: Option<MaxFail>,
    metrics_logging: Option<bool>,
    adaptive: Option<AdaptiveConfig>,
    metrics_source: Option<Box<dyn MetricsSource>>,
}

impl fmt::Debug for TestSchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSchedulerBuilder")
            .field("config", &self.config)
            .field("strategy", &self.strategy)
            .field("test_threads", &self.test_threads)
            .field("thread_limits", &self.thread_limits)
            .field("test_timeout", &self.test_timeout)
            .field("stall_timeout", &self.stall_timeout)
            .field("max_fail", &self.max_fail)
            .field("metrics_logging", &self.metrics_logging)
            .field("adaptive", &self.adaptive)
            .field("metrics_source", &self.metrics_source.as_ref().map(|_| ".."))
            .finish()
    }
}

impl TestSchedulerBuilder {
    /// Creates a new builder from the given config.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Sets whether the concurrency limit is fixed or adaptive.
    pub fn set_strategy(&mut self, strategy: SchedulingStrategy) -> &mut Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the initial number of tests to run simultaneously.
    ///
    /// In fixed mode this is also the only limit.
    pub fn set_test_threads(&mut self, test_threads: TestThreads) -> &mut Self {
        self.test_threads = Some(test_threads);
        self
    }

    /// Sets the concurrency bounds directly, overriding test threads and the
    /// configured min and max.
    pub fn set_thread_limits(&mut self, limits: ThreadLimits) -> &mut Self {
        self.thread_limits = Some(limits);
        self
    }

    /// Sets the default per-test timeout.
    pub fn set_test_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.test_timeout = Some(timeout);
        self
    }

    /// Sets the stall timeout. Zero disables stall detection.
    pub fn set_stall_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Sets the max-fail policy.
    pub fn set_max_fail(&mut self, max_fail: MaxFail) -> &mut Self {
        self.max_fail = Some(max_fail);
        self
    }

    /// Sets whether adjustments and periodic metrics are logged at info level.
    pub fn set_metrics_logging(&mut self, metrics_logging: bool) -> &mut Self {
        self.metrics_logging = Some(metrics_logging);
        self
    }

    /// Sets the adaptive controller tuning.
    pub fn set_adaptive_config(&mut self, adaptive: AdaptiveConfig) -> &mut Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Replaces the system metrics source used in adaptive mode.
    pub fn set_metrics_source(&mut self, source: Box<dyn MetricsSource>) -> &mut Self {
        self.metrics_source = Some(source);
        self
    }

    /// Creates a new scheduler, along with the runtime it runs on.
    pub fn build(self) -> Result<TestScheduler, SchedulerBuildError> {
        let strategy = self.strategy.unwrap_or_else(|| self.config.strategy());
        let limits = match (self.thread_limits, strategy) {
            (Some(limits), _) => {
                if limits.min > limits.max {
                    return Err(SchedulerBuildError::InvalidThreadRange {
                        min: limits.min,
                        max: limits.max,
                    });
                }
                limits
            }
            (None, SchedulingStrategy::Fixed) => ThreadLimits::fixed(
                self.test_threads
                    .unwrap_or_else(|| self.config.test_threads())
                    .compute(),
            ),
            (None, SchedulingStrategy::Adaptive) => {
                let configured = self.config.thread_limits();
                match self.test_threads {
                    Some(test_threads) => ThreadLimits::new(
                        configured.min,
                        test_threads.compute(),
                        configured.max,
                    ),
                    None => configured,
                }
            }
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testflow-worker")
            .build()
            .map_err(SchedulerBuildError::TokioRuntimeCreate)?;

        let adaptive = self
            .adaptive
            .unwrap_or_else(|| self.config.adaptive().clone());
        let metrics_source: Box<dyn MetricsSource> = match self.metrics_source {
            Some(source) => source,
            None => Box::new(SystemMetricsCollector::new()),
        };

        debug!(?strategy, ?limits, "scheduler built");

        Ok(TestScheduler {
            inner: TestSchedulerInner {
                strategy,
                limits,
                test_timeout: self.test_timeout.unwrap_or(self.config.test_timeout()),
                stall_timeout: self.stall_timeout.unwrap_or(self.config.stall_timeout()),
                max_fail: self.max_fail.unwrap_or(self.config.max_fail()),
                metrics_logging: self
                    .metrics_logging
                    .unwrap_or(self.config.metrics_logging()),
                adaptive,
                runtime,
                run_id: RunId::new_v4(),
            },
            metrics_source,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestSchedulerBuilder::build`].
pub struct TestScheduler {
    inner: TestSchedulerInner,
    metrics_source: Box<dyn MetricsSource>,
}

impl fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestScheduler")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl TestScheduler {
    /// Returns the ID of the run this scheduler will execute.
    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    /// Returns the resolved concurrency bounds.
    pub fn thread_limits(&self) -> ThreadLimits {
        self.inner.limits
    }

    /// Executes every test in `test_list` with `executor`.
    ///
    /// Blocks until every test has reached a terminal state. The callback is
    /// called with every event of the run, in order. Cancelling
    /// `cancellation_token` cancels the run: tests that haven't started are
    /// cancelled and running tests are told to stop.
    ///
    /// Returns an error if any of the scheduler's tasks panicked.
    pub fn execute<'a, E, F>(
        self,
        test_list: &'a TestList,
        executor: &E,
        cancellation_token: &CancellationToken,
        mut callback: F,
    ) -> Result<RunStats, SchedulerExecuteErrors<Infallible>>
    where
        E: TestExecutor,
        F: FnMut(TestEvent<'a>) + Send,
    {
        self.try_execute::<Infallible, _, _>(test_list, executor, cancellation_token, |event| {
            callback(event);
            Ok(())
        })
    }

    /// Executes every test in `test_list` with `executor`.
    ///
    /// Accepts a callback that is called with every event of the run. If the
    /// callback returns an error, the run is cancelled and the callback is no
    /// longer called.
    ///
    /// Returns an error if the callback failed or if any of the scheduler's
    /// tasks panicked.
    pub fn try_execute<'a, Err, E, F>(
        self,
        test_list: &'a TestList,
        executor: &E,
        cancellation_token: &CancellationToken,
        mut callback: F,
    ) -> Result<RunStats, SchedulerExecuteErrors<Err>>
    where
        E: TestExecutor,
        F: FnMut(TestEvent<'a>) -> Result<(), Err> + Send,
        Err: fmt::Debug + Send,
    {
        let (report_cancel_tx, report_cancel_rx) = oneshot::channel();

        // If report_cancel_tx is None, an error has occurred and the run has
        // been told to shut down. first_error is set in that case.
        let mut report_cancel_tx = Some(report_cancel_tx);
        let mut first_error = None;

        let Self {
            inner,
            metrics_source,
        } = self;
        let res = inner.execute(
            test_list,
            executor,
            metrics_source,
            cancellation_token,
            report_cancel_rx,
            |event| {
                if report_cancel_tx.is_none() {
                    // The callback has already failed.
                    return;
                }
                if let Err(error) = callback(event) {
                    // Let the dispatcher know that it should start shutting
                    // down.
                    if let Some(report_cancel_tx) = report_cancel_tx.take() {
                        let _ = report_cancel_tx.send(());
                    }
                    first_error = Some(error);
                }
            },
        );

        // Executors may have left tasks behind. Don't wait for them.
        inner.runtime.shutdown_background();

        match (res, first_error) {
            (Ok(run_stats), None) => Ok(run_stats),
            (Ok(_), Some(report_error)) => Err(SchedulerExecuteErrors {
                report_error: Some(report_error),
                join_errors: Vec::new(),
            }),
            (Err(join_errors), report_error) => Err(SchedulerExecuteErrors {
                report_error,
                join_errors,
            }),
        }
    }
}

#[derive(Debug)]
struct TestSchedulerInner {
    strategy: SchedulingStrategy,
    limits: ThreadLimits,
    test_timeout: Duration,
    stall_timeout: Duration,
    max_fail: MaxFail,
    metrics_logging: bool,
    adaptive: AdaptiveConfig,
    runtime: Runtime,
    run_id: RunId,
}

impl TestSchedulerInner {
    fn execute<'a, E, F>(
        &self,
        test_list: &'a TestList,
        executor: &E,
        metrics_source: Box<dyn MetricsSource>,
        cancellation_token: &CancellationToken,
        report_cancel_rx: oneshot::Receiver<()>,
        callback: F,
    ) -> Result<RunStats, Vec<JoinError>>
    where
        E: TestExecutor,
        F: FnMut(TestEvent<'a>) + Send,
    {
        let plan = ExecutionPlan::new(test_list);
        let partitions = ConstraintPartitions::new(&plan);
        let gate = ConcurrencyGate::new(self.limits.initial);
        let gauge = WorkerGauge::new(self.limits.max);
        let state = SchedulerState::new(&plan, &partitions, &gauge);

        let run_token = cancellation_token.child_token();
        let terminate_token = CancellationToken::new();

        let mut dispatcher_cx = DispatcherContext::new(
            callback,
            self.run_id,
            test_list.len(),
            self.max_fail,
            self.stall_timeout,
        );

        // Send the initial events. Tests failed or skipped while planning are
        // reported before anything runs.
        dispatcher_cx.run_started(test_list, self.limits);
        for test in plan.cycle_failed() {
            dispatcher_cx.plan_failed(test);
        }
        for (test, reason) in state.seed() {
            dispatcher_cx.test_skipped(test, reason);
        }

        let executor_cx = ExecutorContext::new(
            executor,
            self.run_id,
            self.test_timeout,
            &state,
            &gate,
            &gauge,
            run_token.clone(),
            terminate_token.clone(),
        );
        let controller = (self.strategy == SchedulingStrategy::Adaptive).then(|| {
            AdaptiveController::new(
                metrics_source,
                self.adaptive.clone(),
                self.limits,
                self.metrics_logging,
            )
        });

        let dispatcher_cx_mut = &mut dispatcher_cx;
        let executor_cx_ref = &executor_cx;
        let state_ref = &state;
        let gate_ref = &gate;
        let gauge_ref = &gauge;
        let run_token_ref = &run_token;
        let terminate_token_ref = &terminate_token;

        let _guard = self.runtime.enter();

        let ((), results) = TokioScope::scope_and_block(move |scope| {
            let (resp_tx, resp_rx) = unbounded_channel::<ExecutorEvent<'a>>();

            // Run the dispatcher to completion in a task.
            let dispatcher_fut = dispatcher_cx_mut.run(
                resp_rx,
                state_ref,
                report_cancel_rx,
                CancelTokens {
                    external: cancellation_token,
                    run: run_token_ref,
                    terminate: terminate_token_ref,
                },
            );
            scope.spawn_cancellable(dispatcher_fut, || ());

            // One worker per unit of maximum parallelism. The gate decides
            // how many of them run tests at once.
            for worker_id in 0..self.limits.max {
                let worker_fut = executor_cx_ref.run_worker(worker_id, resp_tx.clone());
                scope.spawn_cancellable(worker_fut, || ());
            }

            if let Some(controller) = controller {
                let resp_tx = resp_tx.clone();
                let controller_fut =
                    controller.run(gate_ref, gauge_ref, state_ref.done(), move |change| {
                        let _ = resp_tx.send(ExecutorEvent::ParallelismAdjusted(change));
                    });
                scope.spawn_cancellable(controller_fut, || ());
            }

            // The dispatcher exits once every sender is gone.
            drop(resp_tx);
        });

        dispatcher_cx.run_finished();

        // Were there any join errors?
        let join_errors = results
            .into_iter()
            .filter_map(|r| r.err())
            .collect::<Vec<_>>();
        if !join_errors.is_empty() {
            return Err(join_errors);
        }
        Ok(dispatcher_cx.run_stats())
    }
}

/// Builds a scheduler from `config` and executes `test_list` with it.
///
/// A shorthand for [`TestSchedulerBuilder::build`] followed by
/// [`TestScheduler::execute`].
pub fn schedule_and_execute<'a, E, F>(
    config: SchedulerConfig,
    test_list: &'a TestList,
    executor: &E,
    cancellation_token: &CancellationToken,
    callback: F,
) -> Result<RunStats, ScheduleAndExecuteError>
where
    E: TestExecutor,
    F: FnMut(TestEvent<'a>) + Send,
{
    let scheduler = TestSchedulerBuilder::new(config).build()?;
    Ok(scheduler.execute(test_list, executor, cancellation_token, callback)?)
}

/// An error returned by [`schedule_and_execute`].
#[derive(Debug, thiserror::Error)]
pub enum ScheduleAndExecuteError {
    /// The scheduler could not be built.
    #[error(transparent)]
    Build(#[from] SchedulerBuildError),

    /// The run failed internally.
    #[error(transparent)]
    Execute(#[from] SchedulerExecuteErrors<Infallible>),
}
