// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partitioning of tests by constraint class.

use crate::{
    config::{Constraint, TestPriority},
    list::ExecutableTest,
    plan::ExecutionPlan,
};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{cmp::Ordering, collections::BTreeMap};
use tracing::debug;

/// The order in which tests of the same class are offered to workers.
///
/// Sorts by declared order (tests without one last), then by priority (highest
/// first), then by topological rank.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DispatchOrder {
    declared: Option<i32>,
    priority: TestPriority,
    rank: usize,
}

impl DispatchOrder {
    /// Computes the dispatch order for a test with the given rank.
    pub fn new(test: &ExecutableTest, rank: usize) -> Self {
        Self {
            declared: test.constraint().declared_order(),
            priority: test.priority(),
            rank,
        }
    }
}

impl Ord for DispatchOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        // `None` sorts before `Some` by default, so compare presence first.
        (self.declared.is_none(), self.declared)
            .cmp(&(other.declared.is_none(), other.declared))
            // TestPriority already sorts highest first.
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.rank.cmp(&other.rank))
    }
}

impl PartialOrd for DispatchOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The executable tests of a plan, split into the four constraint classes.
///
/// Every ordered collection is sorted by [`DispatchOrder`]. This is a pure
/// partition: building it neither runs nor locks anything.
#[derive(Clone, Debug, Default)]
pub struct ConstraintPartitions<'a> {
    /// Tests without a constraint.
    pub parallel: Vec<&'a ExecutableTest>,

    /// Tests that are exclusive with every other globally exclusive test.
    pub exclusive_global: Vec<&'a ExecutableTest>,

    /// Keyed-exclusive tests, by key. A test with several keys appears under
    /// each of them.
    pub exclusive_keyed: IndexMap<SmolStr, Vec<&'a ExecutableTest>>,

    /// Parallel-group tests, by group name and then by tier.
    pub parallel_groups: IndexMap<SmolStr, BTreeMap<i32, Vec<&'a ExecutableTest>>>,
}

impl<'a> ConstraintPartitions<'a> {
    /// Partitions the executable tests of `plan`.
    ///
    /// Tests that failed planning are not included.
    pub fn new(plan: &ExecutionPlan<'a>) -> Self {
        let mut parallel = Vec::new();
        let mut exclusive_global = Vec::new();
        let mut exclusive_keyed: IndexMap<SmolStr, Vec<_>> = IndexMap::new();
        let mut parallel_groups: IndexMap<SmolStr, BTreeMap<i32, Vec<_>>> = IndexMap::new();

        for (rank, test) in plan.executable().enumerate() {
            let entry = (DispatchOrder::new(test, rank), test);
            match test.constraint() {
                Constraint::Unconstrained => parallel.push(entry),
                Constraint::ExclusiveGlobal { .. } => exclusive_global.push(entry),
                Constraint::ExclusiveKeyed { keys, .. } => {
                    for key in keys {
                        exclusive_keyed.entry(key.clone()).or_default().push(entry);
                    }
                }
                Constraint::ParallelGroup { name, order } => {
                    parallel_groups
                        .entry(name.clone())
                        .or_default()
                        .entry(*order)
                        .or_default()
                        .push(entry);
                }
            }
        }

        let partitions = Self {
            parallel: sorted(parallel),
            exclusive_global: sorted(exclusive_global),
            exclusive_keyed: exclusive_keyed
                .into_iter()
                .map(|(key, tests)| (key, sorted(tests)))
                .collect(),
            parallel_groups: parallel_groups
                .into_iter()
                .map(|(name, tiers)| {
                    let tiers = tiers
                        .into_iter()
                        .map(|(tier, tests)| (tier, sorted(tests)))
                        .collect();
                    (name, tiers)
                })
                .collect(),
        };

        debug!(
            parallel = partitions.parallel.len(),
            exclusive_global = partitions.exclusive_global.len(),
            exclusive_keys = partitions.exclusive_keyed.len(),
            parallel_groups = partitions.parallel_groups.len(),
            "tests partitioned by constraint",
        );

        partitions
    }

    /// Returns the number of tests at each tier of a parallel group.
    pub fn tier_sizes(&self, group: &str) -> BTreeMap<i32, usize> {
        self.parallel_groups
            .get(group)
            .map(|tiers| {
                tiers
                    .iter()
                    .map(|(tier, tests)| (*tier, tests.len()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn sorted<'a>(mut entries: Vec<(DispatchOrder, &'a ExecutableTest)>) -> Vec<&'a ExecutableTest> {
    entries.sort_by_key(|(order, _)| *order);
    entries.into_iter().map(|(_, test)| test).collect()
}
