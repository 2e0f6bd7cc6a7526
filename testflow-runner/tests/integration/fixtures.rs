// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use color_eyre::eyre::Result;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, Once},
    time::{Duration, Instant},
};
use testflow_runner::{
    config::TestThreads,
    errors::ExecutorError,
    list::{ExecutableTest, TestList},
    reporter::{RunStats, TestEvent, TestEventKind},
    runner::{ExecuteContext, ExecutionResult, TestExecutor, TestSchedulerBuilder},
};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = color_eyre::install();
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// What the fixture executor does for a test.
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    Pass,
    Fail,
    Error,
    Panic,
    Skip,
    /// Sleeps, then passes.
    Sleep(Duration),
    /// Sleeps, then fails.
    SleepThenFail(Duration),
    /// Waits for every other test sharing the barrier, then passes.
    Rendezvous(Arc<Barrier>),
    /// Waits for the test's cancellation token, then fails.
    Hang,
    /// Never completes, ignoring cancellation.
    HangForever,
}

/// The interval during which the executor was running a test.
#[derive(Clone, Debug)]
pub(crate) struct Span {
    pub(crate) id: String,
    pub(crate) start: Instant,
    pub(crate) end: Instant,
}

impl Span {
    pub(crate) fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug)]
pub(crate) struct FixtureExecutor {
    default: Behavior,
    behaviors: HashMap<String, Behavior>,
    spans: Mutex<Vec<Span>>,
}

impl FixtureExecutor {
    pub(crate) fn new(default: Behavior) -> Self {
        Self {
            default,
            behaviors: HashMap::new(),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(id.to_owned(), behavior);
        self
    }

    pub(crate) fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub(crate) fn span(&self, id: &str) -> Option<Span> {
        self.spans().into_iter().find(|span| span.id == id)
    }

    pub(crate) fn was_executed(&self, id: &str) -> bool {
        self.span(id).is_some()
    }

    fn record(&self, id: String, start: Instant) {
        self.spans.lock().unwrap().push(Span {
            id,
            start,
            end: Instant::now(),
        });
    }
}

impl TestExecutor for FixtureExecutor {
    fn execute(
        &self,
        test: &ExecutableTest,
        cx: ExecuteContext,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutorError>> + Send {
        let id = test.id().to_string();
        let behavior = self
            .behaviors
            .get(&id)
            .unwrap_or(&self.default)
            .clone();

        async move {
            let start = Instant::now();
            let result = match behavior {
                Behavior::Pass => Ok(ExecutionResult::Pass),
                Behavior::Fail => Ok(ExecutionResult::fail("fixture failure")),
                Behavior::Error => Err(ExecutorError::msg("fixture executor error")),
                Behavior::Panic => panic!("fixture panic in {id}"),
                Behavior::Skip => Ok(ExecutionResult::skip("fixture skip")),
                Behavior::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(ExecutionResult::Pass)
                }
                Behavior::SleepThenFail(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(ExecutionResult::fail("fixture failure"))
                }
                Behavior::Rendezvous(barrier) => {
                    barrier.wait().await;
                    Ok(ExecutionResult::Pass)
                }
                Behavior::Hang => {
                    cx.cancellation_token().cancelled().await;
                    Ok(ExecutionResult::fail("cancelled"))
                }
                Behavior::HangForever => std::future::pending().await,
            };
            self.record(id, start);
            result
        }
    }
}

/// A builder for a fixed-size scheduler with stall detection off.
pub(crate) fn fixed_builder(threads: usize) -> TestSchedulerBuilder {
    let mut builder = TestSchedulerBuilder::default();
    builder
        .set_test_threads(TestThreads::Count(threads))
        .set_stall_timeout(Duration::ZERO)
        .set_test_timeout(Duration::from_secs(30));
    builder
}

pub(crate) fn run_tests<'a>(
    builder: TestSchedulerBuilder,
    test_list: &'a TestList,
    executor: &FixtureExecutor,
) -> Result<(RunStats, Vec<TestEvent<'a>>)> {
    run_tests_with_token(builder, test_list, executor, &CancellationToken::new())
}

pub(crate) fn run_tests_with_token<'a>(
    builder: TestSchedulerBuilder,
    test_list: &'a TestList,
    executor: &FixtureExecutor,
    token: &CancellationToken,
) -> Result<(RunStats, Vec<TestEvent<'a>>)> {
    let scheduler = builder.build()?;
    let mut events = Vec::new();
    let stats = scheduler.execute(test_list, executor, token, |event| events.push(event))?;
    Ok((stats, events))
}

/// Returns the IDs of the tests in `TestStarted` events, in order.
pub(crate) fn started_ids(events: &[TestEvent<'_>]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            TestEventKind::TestStarted { test, .. } => Some(test.id().to_string()),
            _ => None,
        })
        .collect()
}

/// Returns the position of the first event matching `f`.
pub(crate) fn position(
    events: &[TestEvent<'_>],
    f: impl Fn(&TestEventKind<'_>) -> bool,
) -> Option<usize> {
    events.iter().position(|event| f(&event.kind))
}
