// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino::Utf8Path;
use color_eyre::eyre::{Result, bail};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use test_case::test_case;
use testflow_runner::{
    config::{SchedulerConfig, TestPriority},
    errors::TestError,
    list::{ExecutableTest, TestDependency, TestId, TestList, TestState},
    reporter::{RunStats, SkipReason, TestEventKind},
    runner::schedule_and_execute,
};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

#[test]
fn unconstrained_tests_run_concurrently() -> Result<()> {
    test_init();

    // All three tests wait on the same barrier, so the run only completes if
    // they are in flight at the same time.
    let barrier = Arc::new(Barrier::new(3));
    let list = TestList::new(["a", "b", "c"].map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Rendezvous(barrier));

    let (stats, _) = run_tests(fixed_builder(4), &list, &executor)?;

    assert_eq!(
        stats,
        RunStats {
            initial_run_count: 3,
            finished_count: 3,
            passed: 3,
            ..RunStats::default()
        }
    );
    assert!(stats.is_success());
    Ok(())
}

#[test]
fn dependency_chain_runs_in_order() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("deploy").with_dependency("build"),
        ExecutableTest::new("verify").with_dependency("deploy"),
        ExecutableTest::new("build"),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Sleep(Duration::from_millis(5)));

    let (stats, events) = run_tests(fixed_builder(4), &list, &executor)?;

    assert_eq!(started_ids(&events), ["build", "deploy", "verify"]);
    for (before, after) in [("build", "deploy"), ("deploy", "verify")] {
        let before = executor.span(before).expect("dependency ran");
        let after = executor.span(after).expect("dependent ran");
        assert!(before.end <= after.start, "dependent started early");
    }

    assert_eq!(stats.passed, 3);
    for test in list.iter() {
        assert_eq!(test.state(), TestState::Passed);
    }
    assert_eq!(
        list.get("verify").expect("test exists").transitive_dependencies(),
        vec![TestId::new("deploy"), TestId::new("build")],
    );
    Ok(())
}

#[test]
fn run_events_bracket_test_events() -> Result<()> {
    test_init();

    let list = TestList::new(["a", "b"].map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Pass);
    let builder = fixed_builder(2);
    let (stats, events) = run_tests(builder, &list, &executor)?;

    let Some(TestEventKind::RunStarted { thread_limits, .. }) = events.first().map(|e| &e.kind)
    else {
        bail!("first event is not RunStarted");
    };
    assert_eq!(thread_limits.max, 2);

    let Some(TestEventKind::RunFinished { run_stats, .. }) = events.last().map(|e| &e.kind) else {
        bail!("last event is not RunFinished");
    };
    assert_eq!(*run_stats, stats);

    // Every test starts before it finishes.
    for id in ["a", "b"] {
        let started = position(&events, |kind| {
            matches!(kind, TestEventKind::TestStarted { test, .. } if test.id() == id)
        });
        let finished = position(&events, |kind| {
            matches!(kind, TestEventKind::TestFinished { test, .. } if test.id() == id)
        });
        assert!(started < finished, "{id} finished before it started");
    }
    Ok(())
}

#[test_case(false, TestState::Skipped; "skipped without proceed")]
#[test_case(true, TestState::Passed; "runs with proceed")]
fn failed_dependency(proceed_on_failure: bool, expected: TestState) -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("setup"),
        ExecutableTest::new("uses-setup")
            .with_dependency(TestDependency::new("setup").proceed_on_failure(proceed_on_failure)),
        ExecutableTest::new("downstream").with_dependency("uses-setup"),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Pass).with("setup", Behavior::Fail);

    let (stats, events) = run_tests(fixed_builder(2), &list, &executor)?;

    let uses_setup = list.get("uses-setup").expect("test exists");
    let downstream = list.get("downstream").expect("test exists");
    assert_eq!(uses_setup.state(), expected);
    assert_eq!(downstream.state(), expected);
    assert_eq!(executor.was_executed("uses-setup"), proceed_on_failure);
    assert_eq!(executor.was_executed("downstream"), proceed_on_failure);

    if !proceed_on_failure {
        assert_eq!(stats.skipped, 2);
        let skip_reasons: Vec<_> = events
            .iter()
            .filter_map(|event| match &event.kind {
                TestEventKind::TestSkipped { test, reason } => {
                    Some((test.id().to_string(), reason.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            skip_reasons,
            [
                (
                    "uses-setup".to_owned(),
                    SkipReason::DependencyFailed {
                        dependency: "setup".into(),
                        state: TestState::Failed,
                    }
                ),
                (
                    "downstream".to_owned(),
                    SkipReason::DependencyFailed {
                        dependency: "uses-setup".into(),
                        state: TestState::Skipped,
                    }
                ),
            ]
        );
    }
    assert_eq!(stats.failed, 1);
    Ok(())
}

#[test]
fn cycles_fail_without_blocking_the_rest() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("a").with_dependency("b"),
        ExecutableTest::new("b").with_dependency("a"),
        ExecutableTest::new("after-cycle").with_dependency("a"),
        ExecutableTest::new("independent"),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Pass);

    let (stats, events) = run_tests(fixed_builder(2), &list, &executor)?;

    let mut plan_failed: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.kind {
            TestEventKind::TestPlanFailed { test, error, .. } => {
                assert!(error.cycle().contains(test.id()));
                Some(test.id().to_string())
            }
            _ => None,
        })
        .collect();
    plan_failed.sort();
    assert_eq!(plan_failed, ["a", "b"]);

    for id in ["a", "b"] {
        let test = list.get(id).expect("test exists");
        assert_eq!(test.state(), TestState::Failed);
        let error = test.result().and_then(|result| result.error);
        assert!(matches!(error, Some(TestError::CircularDependency(_))));
        assert!(!executor.was_executed(id));
    }
    assert_eq!(
        list.get("after-cycle").expect("test exists").state(),
        TestState::Skipped
    );
    assert_eq!(
        list.get("independent").expect("test exists").state(),
        TestState::Passed
    );
    assert_eq!(
        stats,
        RunStats {
            initial_run_count: 4,
            finished_count: 4,
            passed: 1,
            failed: 2,
            skipped: 1,
            ..RunStats::default()
        }
    );
    Ok(())
}

#[test]
fn timeout_fails_the_test() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("slow").with_timeout(Duration::from_millis(50)),
        ExecutableTest::new("fast"),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Pass).with("slow", Behavior::Hang);

    let (stats, _) = run_tests(fixed_builder(2), &list, &executor)?;

    let slow = list.get("slow").expect("test exists");
    assert_eq!(slow.state(), TestState::Failed);
    let Some(TestError::Timeout(error)) = slow.result().and_then(|result| result.error) else {
        bail!("slow test didn't time out");
    };
    assert_eq!(error.timeout(), Duration::from_millis(50));
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.passed, 1);
    Ok(())
}

#[test]
fn executor_outcomes_are_isolated() -> Result<()> {
    test_init();

    let ids = ["panics", "errors", "skips", "fails", "passes"];
    let list = TestList::new(ids.map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Pass)
        .with("panics", Behavior::Panic)
        .with("errors", Behavior::Error)
        .with("skips", Behavior::Skip)
        .with("fails", Behavior::Fail);

    let (stats, _) = run_tests(fixed_builder(2), &list, &executor)?;

    let error_of = |id: &str| {
        list.get(id)
            .and_then(|test| test.result())
            .and_then(|result| result.error)
    };
    let Some(TestError::Panic(panic)) = error_of("panics") else {
        bail!("panic wasn't caught");
    };
    assert_eq!(panic.message(), "fixture panic in panics");
    assert!(matches!(error_of("errors"), Some(TestError::Executor(_))));
    assert!(matches!(error_of("fails"), Some(TestError::Failed(_))));

    let skips = list.get("skips").and_then(|test| test.result());
    assert_eq!(
        skips.and_then(|result| result.skip_reason),
        Some(SkipReason::Executor {
            reason: "fixture skip".to_owned()
        })
    );

    assert_eq!(
        stats,
        RunStats {
            initial_run_count: 5,
            finished_count: 5,
            passed: 1,
            failed: 1,
            exec_failed: 2,
            skipped: 1,
            ..RunStats::default()
        }
    );
    Ok(())
}

#[test]
fn priority_orders_ready_tests() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("low").with_priority(TestPriority::new(-5)),
        ExecutableTest::new("default"),
        ExecutableTest::new("high").with_priority(TestPriority::new(10)),
        ExecutableTest::new("medium").with_priority(TestPriority::new(3)),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Pass);

    let (_, events) = run_tests(fixed_builder(1), &list, &executor)?;

    assert_eq!(started_ids(&events), ["high", "medium", "default", "low"]);
    Ok(())
}

#[test]
fn report_error_cancels_the_run() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("first"),
        ExecutableTest::new("second").with_dependency("first"),
        ExecutableTest::new("third").with_dependency("first"),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Hang).with("first", Behavior::Pass);
    let scheduler = fixed_builder(1).build()?;

    let mut calls = 0;
    let result = scheduler.try_execute(&list, &executor, &CancellationToken::new(), |event| {
        calls += 1;
        match event.kind {
            TestEventKind::TestFinished { .. } => Err("reporter is full"),
            _ => Ok(()),
        }
    });

    let Err(errors) = result else {
        bail!("report error wasn't propagated");
    };
    assert_eq!(errors.report_error, Some("reporter is full"));
    assert!(errors.join_errors.is_empty());

    // The dependents either never started or were told to stop.
    for id in ["second", "third"] {
        assert_eq!(
            list.get(id).expect("test exists").state(),
            TestState::Cancelled,
            "{id} was cancelled"
        );
    }
    // RunStarted, TestStarted and the failing TestFinished.
    assert_eq!(calls, 3);
    Ok(())
}

#[test]
fn schedule_and_execute_reads_config() -> Result<()> {
    test_init();

    let config = SchedulerConfig::from_toml_str(
        Utf8Path::new("scheduler.toml"),
        indoc! {r#"
            test-threads = 2
            test-timeout = "100ms"
            stall-timeout = "0s"
        "#},
    )?;
    let list = TestList::new(["hangs", "passes"].map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Pass).with("hangs", Behavior::Hang);

    let mut finished = 0;
    let stats = schedule_and_execute(
        config,
        &list,
        &executor,
        &CancellationToken::new(),
        |event| {
            if let TestEventKind::TestFinished { .. } = event.kind {
                finished += 1;
            }
        },
    )?;

    assert_eq!(finished, 2);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.passed, 1);
    Ok(())
}
