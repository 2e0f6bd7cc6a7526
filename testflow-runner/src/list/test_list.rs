// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{Constraint, TestPriority},
    errors::{TestError, TestListError},
    reporter::SkipReason,
};
use chrono::{DateTime, FixedOffset};
use indexmap::{IndexMap, map::Entry};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    borrow::Borrow,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// The unique identifier for a test.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(SmolStr);

impl TestId {
    /// Creates a new `TestId`.
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TestId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl Borrow<str> for TestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for TestId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TestId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dependency edge from one test to another.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestDependency {
    id: TestId,
    proceed_on_failure: bool,
}

impl TestDependency {
    /// Creates a new dependency on the test with the given ID.
    ///
    /// By default, the dependent is skipped if this dependency doesn't pass.
    pub fn new(id: impl Into<TestId>) -> Self {
        Self {
            id: id.into(),
            proceed_on_failure: false,
        }
    }

    /// Sets whether the dependent should still run if this dependency doesn't
    /// pass.
    pub fn proceed_on_failure(mut self, proceed_on_failure: bool) -> Self {
        self.proceed_on_failure = proceed_on_failure;
        self
    }

    /// Returns the ID of the test depended on.
    pub fn id(&self) -> &TestId {
        &self.id
    }

    /// Returns true if the dependent runs even when this dependency fails.
    pub fn proceeds_on_failure(&self) -> bool {
        self.proceed_on_failure
    }
}

impl From<&str> for TestDependency {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<TestId> for TestDependency {
    fn from(id: TestId) -> Self {
        Self::new(id)
    }
}

/// The scheduling state of a test.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestState {
    /// The test is waiting on one or more dependencies.
    #[default]
    NotStarted,

    /// All dependencies have resolved and the test is queued.
    Ready,

    /// The test is being executed.
    Running,

    /// The test passed.
    Passed,

    /// The test failed, timed out, or is part of a dependency cycle.
    Failed,

    /// The test was skipped without completing, either by the executor or
    /// because a dependency didn't pass.
    Skipped,

    /// The run was cancelled before this test could complete.
    Cancelled,
}

impl TestState {
    /// Returns true if this is one of the four outcomes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The final result of a test.
#[derive(Clone, Debug)]
pub struct TestResult {
    /// The terminal state.
    pub state: TestState,

    /// The time the executor was invoked, if it ever was.
    pub start_time: Option<DateTime<FixedOffset>>,

    /// How long the executor ran for. Zero if it never ran.
    pub duration: Duration,

    /// The error, for failed tests.
    pub error: Option<TestError>,

    /// Why the test was skipped, for skipped tests.
    pub skip_reason: Option<SkipReason>,
}

impl TestResult {
    pub(crate) fn not_run(state: TestState) -> Self {
        Self {
            state,
            start_time: None,
            duration: Duration::ZERO,
            error: None,
            skip_reason: None,
        }
    }
}

/// A single unit of work handed to the scheduler.
///
/// Identity, dependencies, constraint and priority are fixed at construction.
/// The scheduler records state transitions and the final result through shared
/// references, so a [`TestList`] can be read by every worker at once.
#[derive(Debug)]
pub struct ExecutableTest {
    id: TestId,
    dependencies: Vec<TestDependency>,
    constraint: Constraint,
    priority: TestPriority,
    timeout: Option<Duration>,
    status: Mutex<TestStatus>,
}

#[derive(Debug, Default)]
struct TestStatus {
    state: TestState,
    result: Option<TestResult>,
    transitive_dependencies: Vec<TestId>,
}

impl ExecutableTest {
    /// Creates a new, unconstrained test with no dependencies.
    pub fn new(id: impl Into<TestId>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            constraint: Constraint::Unconstrained,
            priority: TestPriority::default(),
            timeout: None,
            status: Mutex::new(TestStatus::default()),
        }
    }

    /// Adds a dependency on another test.
    pub fn with_dependency(mut self, dependency: impl Into<TestDependency>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Sets the constraint for this test.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    /// Sets the priority for this test.
    pub fn with_priority(mut self, priority: TestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the run's default timeout for this test.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the ID of this test.
    pub fn id(&self) -> &TestId {
        &self.id
    }

    /// Returns the declared dependencies, in declaration order.
    pub fn dependencies(&self) -> &[TestDependency] {
        &self.dependencies
    }

    /// Returns the constraint for this test.
    pub fn constraint(&self) -> &Constraint {
        &self.constraint
    }

    /// Returns the priority for this test.
    pub fn priority(&self) -> TestPriority {
        self.priority
    }

    /// Returns the per-test timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the current state.
    pub fn state(&self) -> TestState {
        self.status().state
    }

    /// Returns the final result, once the test has reached a terminal state.
    pub fn result(&self) -> Option<TestResult> {
        self.status().result.clone()
    }

    /// Returns every test this one depends on, directly or indirectly.
    ///
    /// Populated when the execution plan is built. This is informational and
    /// never consulted while scheduling.
    pub fn transitive_dependencies(&self) -> Vec<TestId> {
        self.status().transitive_dependencies.clone()
    }

    pub(crate) fn set_state(&self, state: TestState) {
        self.status().state = state;
    }

    pub(crate) fn finish(&self, result: TestResult) {
        let mut status = self.status();
        status.state = result.state;
        status.result = Some(result);
    }

    pub(crate) fn set_transitive_dependencies(&self, deps: Vec<TestId>) {
        self.status().transitive_dependencies = deps;
    }

    fn status(&self) -> MutexGuard<'_, TestStatus> {
        // The status is plain data, so a panic while holding the lock can't
        // leave it half-updated.
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The tests that make up a single run, in discovery order.
#[derive(Debug)]
pub struct TestList {
    tests: IndexMap<TestId, ExecutableTest>,
}

impl TestList {
    /// Creates a new test list, rejecting duplicate IDs.
    pub fn new(tests: impl IntoIterator<Item = ExecutableTest>) -> Result<Self, TestListError> {
        let mut map = IndexMap::new();
        for test in tests {
            match map.entry(test.id.clone()) {
                Entry::Occupied(entry) => {
                    return Err(TestListError::DuplicateTestId {
                        id: entry.key().clone(),
                    });
                }
                Entry::Vacant(entry) => {
                    entry.insert(test);
                }
            }
        }
        Ok(Self { tests: map })
    }

    /// Returns the number of tests in the list.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Looks up a test by ID.
    pub fn get(&self, id: &str) -> Option<&ExecutableTest> {
        self.tests.get(id)
    }

    /// Iterates over the tests in discovery order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &ExecutableTest> + '_ {
        self.tests.values()
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
        self.tests.get_index_of(id)
    }

    pub(crate) fn by_index(&self, ix: usize) -> &ExecutableTest {
        &self.tests[ix]
    }
}

impl<'a> IntoIterator for &'a TestList {
    type Item = &'a ExecutableTest;
    type IntoIter = indexmap::map::Values<'a, TestId, ExecutableTest>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.values()
    }
}
