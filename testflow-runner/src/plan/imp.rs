// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::Constraint,
    errors::{CircularDependencyError, TestError},
    list::{ExecutableTest, TestId, TestList, TestResult, TestState},
};
use petgraph::{
    Directed, Graph,
    algo::scc::kosaraju_scc,
    graph::{Neighbors, NodeIndex},
};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// The maximum number of nodes visited while computing a single test's
/// transitive dependencies.
const TRANSITIVE_ITERATION_CAP: usize = 10_000;

/// An edge from a test to one of its dependencies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PlanEdge {
    /// Index of the dependency in the test list.
    pub(crate) test: usize,
    pub(crate) proceed_on_failure: bool,
}

/// The dependency structure of a run.
///
/// Built once per run from a [`TestList`]. Construction fails every test that
/// is part of a dependency cycle (these tests stay in the list, in the
/// [`Failed`](TestState::Failed) state). It then ranks the remaining tests
/// topologically and records each one's transitive dependencies.
///
/// Ranks are only used to break ties between otherwise equivalent tests.
#[derive(Debug)]
pub struct ExecutionPlan<'a> {
    test_list: &'a TestList,
    dependencies: Vec<SmallVec<[PlanEdge; 4]>>,
    dependents: Vec<SmallVec<[usize; 4]>>,
    ranks: Vec<Option<usize>>,
    order: Vec<usize>,
    cycle_failed: Vec<usize>,
}

#[derive(Clone, Debug)]
enum PlanNode {
    Test(usize),
    /// Stands between one tier of a parallel group and the next: it depends on
    /// every test in the lower tier, and every test in the next tier depends
    /// on it.
    TierBarrier,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

impl<'a> ExecutionPlan<'a> {
    /// Builds the plan for `test_list`, failing tests that are part of a
    /// dependency cycle.
    ///
    /// Dependencies on IDs that aren't in the list are ignored with a warning.
    pub fn new(test_list: &'a TestList) -> Self {
        let (dependencies, dependents) = Self::build_adjacency(test_list);

        // Edges point from a node to the nodes it depends on.
        let mut graph = Graph::<PlanNode, (), Directed>::with_capacity(test_list.len(), 0);
        for ix in 0..test_list.len() {
            graph.add_node(PlanNode::Test(ix));
        }
        for (ix, edges) in dependencies.iter().enumerate() {
            // petgraph yields neighbors newest-first. Insert in reverse so
            // traversal follows declaration order.
            for edge in edges.iter().rev() {
                graph.add_edge(NodeIndex::new(ix), NodeIndex::new(edge.test), ());
            }
        }
        Self::add_tier_barriers(test_list, &mut graph);

        let Traversal { post_order, cycles } = Self::traverse(&graph);

        let mut cycle_of: Vec<Option<Vec<TestId>>> = vec![None; test_list.len()];
        for cycle in cycles {
            let members: Vec<usize> = cycle
                .iter()
                .filter_map(|node| match graph[*node] {
                    PlanNode::Test(ix) => Some(ix),
                    PlanNode::TierBarrier => None,
                })
                .collect();
            let ids: Vec<TestId> = members
                .iter()
                .map(|ix| test_list.by_index(*ix).id().clone())
                .collect();
            for ix in members {
                cycle_of[ix].get_or_insert_with(|| ids.clone());
            }
        }

        // Stack walking only reports the cycles closed by back-edges. A node
        // that reaches an already-finished cycle through a side path is part
        // of the same strongly connected component but is never on the stack
        // at the right moment, so sweep components as well.
        for scc in kosaraju_scc(&graph) {
            let is_cycle = scc.len() >= 2 || graph.contains_edge(scc[0], scc[0]);
            if !is_cycle {
                continue;
            }
            let mut members: Vec<usize> = scc
                .iter()
                .filter_map(|node| match graph[*node] {
                    PlanNode::Test(ix) => Some(ix),
                    PlanNode::TierBarrier => None,
                })
                .collect();
            members.sort_unstable();
            let ids: Vec<TestId> = members
                .iter()
                .map(|ix| test_list.by_index(*ix).id().clone())
                .collect();
            for ix in members {
                cycle_of[ix].get_or_insert_with(|| ids.clone());
            }
        }

        let mut cycle_failed = Vec::new();
        for (ix, cycle) in cycle_of.into_iter().enumerate() {
            let Some(cycle) = cycle else { continue };
            let test = test_list.by_index(ix);
            let error = CircularDependencyError::new(test.id().clone(), cycle);
            warn!("{error}");
            test.finish(TestResult {
                error: Some(TestError::CircularDependency(error)),
                ..TestResult::not_run(TestState::Failed)
            });
            cycle_failed.push(ix);
        }

        let mut ranks = vec![None; test_list.len()];
        let mut order = Vec::with_capacity(test_list.len() - cycle_failed.len());
        for node in post_order {
            if let PlanNode::Test(ix) = graph[node] {
                if cycle_failed.binary_search(&ix).is_err() {
                    ranks[ix] = Some(order.len());
                    order.push(ix);
                }
            }
        }

        let plan = Self {
            test_list,
            dependencies,
            dependents,
            ranks,
            order,
            cycle_failed,
        };
        plan.record_transitive_dependencies();

        debug!(
            total = test_list.len(),
            executable = plan.order.len(),
            cycle_failed = plan.cycle_failed.len(),
            "execution plan built",
        );

        plan
    }

    /// Returns the test list this plan was built from.
    pub fn test_list(&self) -> &'a TestList {
        self.test_list
    }

    /// Iterates over the tests that can be scheduled, in rank order.
    pub fn executable(&self) -> impl ExactSizeIterator<Item = &'a ExecutableTest> + '_ {
        self.order
            .iter()
            .map(|ix| self.test_list.by_index(*ix))
    }

    /// Iterates over the tests that were failed because they are part of a
    /// dependency cycle.
    pub fn cycle_failed(&self) -> impl ExactSizeIterator<Item = &'a ExecutableTest> + '_ {
        self.cycle_failed
            .iter()
            .map(|ix| self.test_list.by_index(*ix))
    }

    /// Returns the topological rank of a test, or `None` if the test isn't in
    /// the list or is part of a cycle.
    pub fn rank(&self, id: &str) -> Option<usize> {
        self.test_list.index_of(id).and_then(|ix| self.ranks[ix])
    }

    /// Iterates over the direct dependencies of a test that exist in the list.
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &'a ExecutableTest> + '_ {
        self.test_list
            .index_of(id)
            .into_iter()
            .flat_map(|ix| self.dependencies[ix].iter())
            .map(|edge| self.test_list.by_index(edge.test))
    }

    /// Iterates over the tests that directly depend on a test.
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &'a ExecutableTest> + '_ {
        self.test_list
            .index_of(id)
            .into_iter()
            .flat_map(|ix| self.dependents[ix].iter())
            .map(|ix| self.test_list.by_index(*ix))
    }

    pub(crate) fn executable_indexes(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn cycle_failed_indexes(&self) -> &[usize] {
        &self.cycle_failed
    }

    pub(crate) fn dependency_edges(&self, ix: usize) -> &[PlanEdge] {
        &self.dependencies[ix]
    }

    pub(crate) fn dependent_indexes(&self, ix: usize) -> &[usize] {
        &self.dependents[ix]
    }

    /// Rank of an executable test. Cycle members sort after everything.
    pub(crate) fn rank_of(&self, ix: usize) -> usize {
        self.ranks[ix].unwrap_or(usize::MAX)
    }

    #[allow(clippy::type_complexity)]
    fn build_adjacency(
        test_list: &TestList,
    ) -> (Vec<SmallVec<[PlanEdge; 4]>>, Vec<SmallVec<[usize; 4]>>) {
        let mut dependencies = vec![SmallVec::<[PlanEdge; 4]>::new(); test_list.len()];
        let mut dependents = vec![SmallVec::<[usize; 4]>::new(); test_list.len()];

        for (ix, test) in test_list.iter().enumerate() {
            for dep in test.dependencies() {
                let Some(dep_ix) = test_list.index_of(dep.id().as_str()) else {
                    warn!(
                        "test `{}` depends on unknown test `{}`, ignoring",
                        test.id(),
                        dep.id(),
                    );
                    continue;
                };

                // A repeated edge keeps the strictest failure policy.
                match dependencies[ix].iter_mut().find(|edge| edge.test == dep_ix) {
                    Some(edge) => edge.proceed_on_failure &= dep.proceeds_on_failure(),
                    None => {
                        dependencies[ix].push(PlanEdge {
                            test: dep_ix,
                            proceed_on_failure: dep.proceeds_on_failure(),
                        });
                        dependents[dep_ix].push(ix);
                    }
                }
            }
        }

        (dependencies, dependents)
    }

    /// Adds barrier nodes so that tier ordering within parallel groups shows
    /// up as graph edges. A declared dependency that contradicts tier order
    /// then closes a cycle instead of deadlocking the run.
    fn add_tier_barriers(test_list: &TestList, graph: &mut Graph<PlanNode, (), Directed>) {
        let mut groups: BTreeMap<&SmolStr, BTreeMap<i32, Vec<usize>>> = BTreeMap::new();
        for (ix, test) in test_list.iter().enumerate() {
            if let Constraint::ParallelGroup { name, order } = test.constraint() {
                groups
                    .entry(name)
                    .or_default()
                    .entry(*order)
                    .or_default()
                    .push(ix);
            }
        }

        for tiers in groups.values() {
            for (lower, upper) in tiers.values().zip(tiers.values().skip(1)) {
                let barrier = graph.add_node(PlanNode::TierBarrier);
                for ix in lower {
                    graph.add_edge(barrier, NodeIndex::new(*ix), ());
                }
                for ix in upper {
                    graph.add_edge(NodeIndex::new(*ix), barrier, ());
                }
            }
        }
    }

    /// Iterative depth-first traversal along dependency edges.
    ///
    /// Produces a post-order (dependencies before dependents) and, for every
    /// back-edge into the active stack, the stack segment that forms the
    /// cycle.
    fn traverse(graph: &Graph<PlanNode, (), Directed>) -> Traversal {
        let mut marks = vec![Mark::Unvisited; graph.node_count()];
        let mut post_order = Vec::with_capacity(graph.node_count());
        let mut cycles = Vec::new();
        let mut stack: Vec<(NodeIndex, Neighbors<'_, ()>)> = Vec::new();

        for root in graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            marks[root.index()] = Mark::Active;
            stack.push((root, graph.neighbors(root)));

            while let Some((node, neighbors)) = stack.last_mut() {
                let node = *node;
                let Some(dep) = neighbors.next() else {
                    marks[node.index()] = Mark::Done;
                    post_order.push(node);
                    stack.pop();
                    continue;
                };

                match marks[dep.index()] {
                    Mark::Unvisited => {
                        marks[dep.index()] = Mark::Active;
                        stack.push((dep, graph.neighbors(dep)));
                    }
                    Mark::Active => {
                        // Each stack entry depends on the one above it, and
                        // `node` (the top) depends on `dep`.
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == dep)
                            .unwrap_or(stack.len() - 1);
                        cycles.push(stack[start..].iter().map(|(n, _)| *n).collect());
                    }
                    Mark::Done => {}
                }
            }
        }

        Traversal { post_order, cycles }
    }

    fn record_transitive_dependencies(&self) {
        let mut memo: Vec<Option<Vec<usize>>> = vec![None; self.test_list.len()];

        // Rank order guarantees that every executable dependency has been
        // computed before its dependents.
        for &ix in &self.order {
            let closure = self.transitive_closure(ix, &memo);
            let ids = closure
                .iter()
                .map(|dep| self.test_list.by_index(*dep).id().clone())
                .collect();
            self.test_list.by_index(ix).set_transitive_dependencies(ids);
            memo[ix] = Some(closure);
        }
    }

    fn transitive_closure(&self, ix: usize, memo: &[Option<Vec<usize>>]) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut closure = Vec::new();
        let mut queue: VecDeque<usize> = self.dependencies[ix].iter().map(|e| e.test).collect();
        let mut iterations = 0;

        while let Some(dep) = queue.pop_front() {
            iterations += 1;
            if iterations > TRANSITIVE_ITERATION_CAP {
                warn!(
                    "transitive dependencies of `{}` truncated after {TRANSITIVE_ITERATION_CAP} \
                     iterations",
                    self.test_list.by_index(ix).id(),
                );
                break;
            }
            if dep == ix || !seen.insert(dep) {
                continue;
            }
            closure.push(dep);

            match &memo[dep] {
                Some(cached) => {
                    for &indirect in cached {
                        if indirect != ix && seen.insert(indirect) {
                            closure.push(indirect);
                        }
                    }
                }
                None => queue.extend(self.dependencies[dep].iter().map(|e| e.test)),
            }
        }

        closure
    }
}

struct Traversal {
    post_order: Vec<NodeIndex>,
    cycles: Vec<Vec<NodeIndex>>,
}
