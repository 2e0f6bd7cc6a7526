// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::time::Duration;
use test_case::test_case;
use testflow_runner::{
    config::{MaxFail, TerminateMode, TestPriority},
    list::{ExecutableTest, TestList, TestState},
    reporter::{CancelReason, TestEvent, TestEventKind},
};
use tokio_util::sync::CancellationToken;

fn cancel_reasons(events: &[TestEvent<'_>]) -> Vec<CancelReason> {
    events
        .iter()
        .filter_map(|event| match event.kind {
            TestEventKind::RunBeginCancel { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

#[test_case(None; "cancelled before the run")]
#[test_case(Some(Duration::from_millis(100)); "cancelled during the run")]
fn external_cancellation(delay: Option<Duration>) -> Result<()> {
    test_init();

    let list = TestList::new(["a", "b", "c", "d", "e"].map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Hang);
    let token = CancellationToken::new();

    let canceller = match delay {
        None => {
            token.cancel();
            None
        }
        Some(delay) => {
            let token = token.clone();
            Some(std::thread::spawn(move || {
                std::thread::sleep(delay);
                token.cancel();
            }))
        }
    };

    let (stats, events) = run_tests_with_token(fixed_builder(2), &list, &executor, &token)?;
    if let Some(canceller) = canceller {
        canceller.join().expect("canceller thread panicked");
    }

    assert_eq!(cancel_reasons(&events), [CancelReason::External]);
    for test in list.iter() {
        assert_eq!(test.state(), TestState::Cancelled, "{} cancelled", test.id());
    }
    assert_eq!(stats.cancelled, 5);
    assert_eq!(stats.finished_count, 5);
    assert!(!stats.is_success());
    Ok(())
}

#[test_case(TerminateMode::Wait, Behavior::Hang; "wait for cooperative test")]
#[test_case(TerminateMode::Immediate, Behavior::HangForever; "drop stuck test")]
fn max_fail_cancels_remaining_tests(terminate: TerminateMode, running: Behavior) -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("fails").with_priority(TestPriority::new(10)),
        ExecutableTest::new("running").with_priority(TestPriority::new(5)),
        ExecutableTest::new("queued-1"),
        ExecutableTest::new("queued-2"),
    ])?;
    // Queued tests may be picked up in the window between the failure and the
    // cancellation, so they hang until cancelled as well.
    let executor = FixtureExecutor::new(Behavior::Hang)
        .with("fails", Behavior::SleepThenFail(Duration::from_millis(50)))
        .with("running", running);

    let mut builder = fixed_builder(2);
    builder.set_max_fail(MaxFail::Count {
        max_fail: 1,
        terminate,
    });
    let (stats, events) = run_tests(builder, &list, &executor)?;

    assert_eq!(cancel_reasons(&events), [CancelReason::TestFailure]);
    assert_eq!(
        list.get("fails").expect("test exists").state(),
        TestState::Failed
    );
    for id in ["running", "queued-1", "queued-2"] {
        assert_eq!(
            list.get(id).expect("test exists").state(),
            TestState::Cancelled,
            "{id} cancelled"
        );
    }
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 3);
    Ok(())
}

#[test]
fn failures_under_the_limit_keep_running() -> Result<()> {
    test_init();

    let list = TestList::new(["a", "b", "c", "d"].map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Pass)
        .with("a", Behavior::Fail)
        .with("b", Behavior::Fail);

    let mut builder = fixed_builder(1);
    builder.set_max_fail(MaxFail::Count {
        max_fail: 3,
        terminate: TerminateMode::Wait,
    });
    let (stats, events) = run_tests(builder, &list, &executor)?;

    assert!(cancel_reasons(&events).is_empty());
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.passed, 2);
    Ok(())
}

#[test]
fn stall_is_reported_without_cancelling() -> Result<()> {
    test_init();

    let list = TestList::new(["slow", "fast"].map(ExecutableTest::new))?;
    let executor = FixtureExecutor::new(Behavior::Pass)
        .with("slow", Behavior::Sleep(Duration::from_millis(300)));

    let mut builder = fixed_builder(2);
    builder.set_stall_timeout(Duration::from_millis(50));
    let (stats, events) = run_tests(builder, &list, &executor)?;

    let stalls: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.kind {
            TestEventKind::RunStalled {
                running,
                since_last_progress,
            } => Some((
                running.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                *since_last_progress,
            )),
            _ => None,
        })
        .collect();
    assert_eq!(stalls.len(), 1, "one stall reported: {stalls:?}");
    assert_eq!(stalls[0].0, ["slow"]);
    assert!(stalls[0].1 >= Duration::from_millis(50));

    assert!(cancel_reasons(&events).is_empty());
    assert_eq!(stats.passed, 2);
    Ok(())
}

#[test]
fn cancelled_test_outliving_its_timeout_is_cancelled() -> Result<()> {
    test_init();

    // "slow" is well within its timeout when "fails" cancels the run, and
    // ignores the cancellation until after the timeout has elapsed.
    let list = TestList::new([
        ExecutableTest::new("fails"),
        ExecutableTest::new("slow").with_timeout(Duration::from_millis(500)),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Pass)
        .with("fails", Behavior::SleepThenFail(Duration::from_millis(20)))
        .with("slow", Behavior::Sleep(Duration::from_millis(1500)));

    let mut builder = fixed_builder(2);
    builder.set_max_fail(MaxFail::Count {
        max_fail: 1,
        terminate: TerminateMode::Wait,
    });
    let (stats, events) = run_tests(builder, &list, &executor)?;

    assert_eq!(cancel_reasons(&events), [CancelReason::TestFailure]);
    let slow = list.get("slow").expect("test exists");
    assert_eq!(slow.state(), TestState::Cancelled);
    assert_eq!(stats.timed_out, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 1);
    Ok(())
}
