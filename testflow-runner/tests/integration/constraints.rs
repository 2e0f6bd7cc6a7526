// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::{sync::Arc, time::Duration};
use test_case::test_case;
use test_strategy::proptest;
use testflow_runner::{
    adaptive::{AdjustmentDirection, MetricsSource, PoolSnapshot, SystemMetrics},
    config::{AdaptiveConfig, Constraint, SchedulingStrategy, ThreadLimits},
    list::{ExecutableTest, TestList, TestState},
    reporter::TestEventKind,
};
use tokio::sync::Barrier;

const SHORT: Duration = Duration::from_millis(10);

fn assert_no_overlap(executor: &FixtureExecutor, ids: &[&str]) {
    let spans: Vec<_> = executor
        .spans()
        .into_iter()
        .filter(|span| ids.contains(&span.id.as_str()))
        .collect();
    assert_eq!(spans.len(), ids.len(), "every test ran");
    for (i, a) in spans.iter().enumerate() {
        for b in &spans[i + 1..] {
            assert!(!a.overlaps(b), "{} and {} overlapped", a.id, b.id);
        }
    }
}

#[test]
fn shared_key_serializes() -> Result<()> {
    test_init();

    let list = TestList::new(
        ["db-1", "db-2", "db-3"]
            .map(|id| ExecutableTest::new(id).with_constraint(Constraint::not_in_parallel(["db"]))),
    )?;
    let executor = FixtureExecutor::new(Behavior::Sleep(SHORT));

    let (stats, _) = run_tests(fixed_builder(4), &list, &executor)?;

    assert_no_overlap(&executor, &["db-1", "db-2", "db-3"]);
    assert_eq!(stats.passed, 3);
    Ok(())
}

#[test]
fn disjoint_keys_run_concurrently() -> Result<()> {
    test_init();

    // Only completes if both tests are in flight together.
    let barrier = Arc::new(Barrier::new(2));
    let list = TestList::new([
        ExecutableTest::new("x").with_constraint(Constraint::not_in_parallel(["x"])),
        ExecutableTest::new("y").with_constraint(Constraint::not_in_parallel(["y"])),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Rendezvous(barrier));

    let (stats, _) = run_tests(fixed_builder(4), &list, &executor)?;
    assert_eq!(stats.passed, 2);
    Ok(())
}

#[test]
fn multi_key_tests_exclude_each_key() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("x-and-y").with_constraint(Constraint::not_in_parallel(["x", "y"])),
        ExecutableTest::new("x").with_constraint(Constraint::not_in_parallel(["x"])),
        ExecutableTest::new("y").with_constraint(Constraint::not_in_parallel(["y"])),
        ExecutableTest::new("z").with_constraint(Constraint::not_in_parallel(["z"])),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Sleep(SHORT));

    for _ in 0..5 {
        let (stats, _) = run_tests(fixed_builder(4), &list, &executor)?;
        assert_eq!(stats.passed, 4);
    }

    let spans = executor.spans();
    for multi in spans.iter().filter(|span| span.id == "x-and-y") {
        for other in spans.iter().filter(|span| span.id == "x" || span.id == "y") {
            assert!(!multi.overlaps(other), "x-and-y overlapped {}", other.id);
        }
    }
    Ok(())
}

#[test]
fn global_exclusive_tests_serialize() -> Result<()> {
    test_init();

    let global = ["global-1", "global-2", "global-3"];
    let list = TestList::new(
        global
            .map(|id| {
                ExecutableTest::new(id)
                    .with_constraint(Constraint::not_in_parallel([] as [&str; 0]))
            })
            .into_iter()
            .chain(["free-1", "free-2"].map(ExecutableTest::new)),
    )?;
    let executor = FixtureExecutor::new(Behavior::Sleep(SHORT));

    let (stats, _) = run_tests(fixed_builder(4), &list, &executor)?;

    assert_no_overlap(&executor, &global);
    assert_eq!(stats.passed, 5);
    Ok(())
}

#[test]
fn exclusive_order_is_respected() -> Result<()> {
    test_init();

    let constraint = |order| Constraint::not_in_parallel(["k"]).with_order(order);
    let list = TestList::new([
        ExecutableTest::new("third").with_constraint(constraint(3)),
        ExecutableTest::new("first").with_constraint(constraint(1)),
        ExecutableTest::new("second").with_constraint(constraint(2)),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Pass);

    let (_, events) = run_tests(fixed_builder(4), &list, &executor)?;
    assert_eq!(started_ids(&events), ["first", "second", "third"]);
    Ok(())
}

#[test]
fn group_tiers_run_in_order() -> Result<()> {
    test_init();

    // Tier 0 of `web` can only finish if both of its tests run together.
    let barrier = Arc::new(Barrier::new(2));
    let web = |id: &str, tier| {
        ExecutableTest::new(id).with_constraint(Constraint::parallel_group("web", tier))
    };
    let list = TestList::new([
        web("web-1a", 1),
        web("web-0a", 0),
        web("web-1b", 1),
        web("web-0b", 0),
        ExecutableTest::new("api").with_constraint(Constraint::parallel_group("api", 0)),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Sleep(SHORT))
        .with("web-0a", Behavior::Rendezvous(barrier.clone()))
        .with("web-0b", Behavior::Rendezvous(barrier));

    let (stats, _) = run_tests(fixed_builder(4), &list, &executor)?;
    assert_eq!(stats.passed, 5);

    let span = |id| executor.span(id).expect("test ran");
    for lower in ["web-0a", "web-0b"] {
        for upper in ["web-1a", "web-1b"] {
            assert!(
                span(lower).end <= span(upper).start,
                "{upper} started before {lower} finished"
            );
        }
    }
    for web in ["web-0a", "web-0b", "web-1a", "web-1b"] {
        assert!(!span(web).overlaps(&span("api")), "{web} overlapped api");
    }
    Ok(())
}

#[test]
fn constraints_and_dependencies_combine() -> Result<()> {
    test_init();

    let list = TestList::new([
        ExecutableTest::new("migrate").with_constraint(Constraint::not_in_parallel(["db"])),
        ExecutableTest::new("query")
            .with_constraint(Constraint::not_in_parallel(["db"]))
            .with_dependency("migrate"),
        ExecutableTest::new("report").with_dependency("query"),
    ])?;
    let executor = FixtureExecutor::new(Behavior::Sleep(SHORT));

    let (stats, events) = run_tests(fixed_builder(4), &list, &executor)?;

    assert_eq!(started_ids(&events), ["migrate", "query", "report"]);
    assert_eq!(stats.passed, 3);
    Ok(())
}

/// Randomized constraint assignments never let conflicting tests overlap.
#[proptest(cases = 16)]
fn mutual_exclusion_holds(
    #[strategy(proptest::collection::vec(0..5_u8, 4..10))] kinds: Vec<u8>,
    #[strategy(1..5_usize)] threads: usize,
) {
    test_init();

    let constraint = |kind: u8| match kind {
        0 => Constraint::Unconstrained,
        1 => Constraint::not_in_parallel(["a"]),
        2 => Constraint::not_in_parallel(["b"]),
        3 => Constraint::not_in_parallel(["a", "b"]),
        _ => Constraint::not_in_parallel([] as [&str; 0]),
    };
    let list = TestList::new(
        kinds.iter().enumerate().map(|(i, &kind)| {
            ExecutableTest::new(format!("t{i}")).with_constraint(constraint(kind))
        }),
    )
    .expect("IDs are unique");
    let executor = FixtureExecutor::new(Behavior::Sleep(Duration::from_millis(2)));

    let (stats, _) = run_tests(fixed_builder(threads), &list, &executor).expect("run succeeded");
    assert_eq!(stats.passed, kinds.len());

    let spans = executor.spans();
    let test_of = |id: &str| list.get(id).expect("test exists");
    for (i, a) in spans.iter().enumerate() {
        for b in &spans[i + 1..] {
            let a_keys = test_of(&a.id).constraint().lock_keys();
            let b_keys = test_of(&b.id).constraint().lock_keys();
            if a_keys.iter().any(|key| b_keys.contains(key)) {
                assert!(!a.overlaps(b), "{} and {} overlapped", a.id, b.id);
            }
        }
    }
}

/// One randomly generated test: its dependencies on earlier tests, a
/// constraint kind, a group tier and whether it fails.
type TestShape = (Vec<usize>, u8, i32, bool);

fn mixed_graph_strategy() -> impl Strategy<Value = Vec<TestShape>> {
    (1usize..16).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                (
                    proptest::collection::vec(0..i.max(1), 0..=i.min(3))
                        .prop_map(move |deps| deps.into_iter().filter(|&j| j < i).collect()),
                    0..7_u8,
                    0..3_i32,
                    proptest::bool::weighted(0.2),
                )
            })
            .collect::<Vec<_>>()
    })
}

/// Every test of an acyclic graph reaches exactly one outcome, whatever mix
/// of constraints and failures it carries.
#[proptest(cases = 24)]
fn acyclic_graphs_finish_every_test(
    #[strategy(mixed_graph_strategy())] shapes: Vec<TestShape>,
    #[strategy(1..5_usize)] threads: usize,
) {
    test_init();

    let constraint = |kind: u8, tier: i32| match kind {
        0 | 1 => Constraint::Unconstrained,
        2 => Constraint::not_in_parallel(["a"]),
        3 => Constraint::not_in_parallel(["a", "b"]),
        4 => Constraint::not_in_parallel([] as [&str; 0]),
        5 => Constraint::parallel_group("g", tier),
        _ => Constraint::parallel_group("h", tier),
    };
    let tests = shapes.iter().enumerate().rev().map(|(i, (deps, kind, tier, _))| {
        deps.iter().fold(
            ExecutableTest::new(format!("t{i}")).with_constraint(constraint(*kind, *tier)),
            |test, dep| test.with_dependency(format!("t{dep}").as_str()),
        )
    });
    let list = TestList::new(tests).expect("IDs are unique");
    let executor = shapes.iter().enumerate().fold(
        FixtureExecutor::new(Behavior::Sleep(Duration::from_millis(1))),
        |executor, (i, (_, _, _, fails))| {
            if *fails {
                executor.with(&format!("t{i}"), Behavior::Fail)
            } else {
                executor
            }
        },
    );

    let (stats, events) =
        run_tests(fixed_builder(threads), &list, &executor).expect("run succeeded");

    prop_assert_eq!(stats.finished_count, shapes.len());
    prop_assert_eq!(stats.cancelled, 0);
    let started_ids = started_ids(&events);
    for test in list.iter() {
        prop_assert!(test.state().is_terminal(), "{} is {}", test.id(), test.state());
        let started = started_ids
            .iter()
            .filter(|id| **id == test.id().as_str())
            .count();
        prop_assert!(started <= 1, "{} started {started} times", test.id());
    }
}

/// Reports fixed CPU usage, with the scheduler's own pool counters.
#[derive(Debug)]
struct SyntheticMetrics {
    cpu_usage_percent: f64,
}

impl MetricsSource for SyntheticMetrics {
    fn sample(&mut self, pool: PoolSnapshot) -> SystemMetrics {
        SystemMetrics {
            cpu_usage_percent: self.cpu_usage_percent,
            // Report an idle pool so that only CPU drives the decision.
            available_workers: pool.max_workers,
            max_workers: pool.max_workers,
            pending_work_items: 0,
            memory_bytes: 0,
            completed_work_items: pool.completed_work_items,
        }
    }
}

#[test_case(5.0, ThreadLimits::new(1, 1, 8), AdjustmentDirection::Increase; "idle system grows")]
#[test_case(99.0, ThreadLimits::new(1, 8, 8), AdjustmentDirection::Decrease; "busy system shrinks")]
fn adaptive_limit_follows_load(
    cpu_usage_percent: f64,
    limits: ThreadLimits,
    expected: AdjustmentDirection,
) -> Result<()> {
    test_init();

    let list = TestList::new((0..12).map(|i| ExecutableTest::new(format!("t{i}"))))?;
    let executor = FixtureExecutor::new(Behavior::Sleep(Duration::from_millis(40)));

    let mut builder = fixed_builder(1);
    builder
        .set_strategy(SchedulingStrategy::Adaptive)
        .set_thread_limits(limits)
        .set_adaptive_config(AdaptiveConfig {
            interval: Duration::from_millis(10),
            ..AdaptiveConfig::default()
        })
        .set_metrics_source(Box::new(SyntheticMetrics { cpu_usage_percent }));
    let (stats, events) = run_tests(builder, &list, &executor)?;

    let changes: Vec<_> = events
        .iter()
        .filter_map(|event| match event.kind {
            TestEventKind::ParallelismAdjusted {
                previous,
                current,
                direction,
                ..
            } => Some((previous, current, direction)),
            _ => None,
        })
        .collect();
    assert!(!changes.is_empty(), "the limit was adjusted");
    for &(previous, current, direction) in &changes {
        assert_eq!(direction, expected);
        assert_ne!(previous, current);
        assert!((limits.min..=limits.max).contains(&current));
    }

    assert_eq!(stats.passed, 12);
    for test in list.iter() {
        assert_eq!(test.state(), TestState::Passed);
    }
    Ok(())
}
