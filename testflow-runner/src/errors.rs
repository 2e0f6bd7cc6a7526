// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the scheduler.

use crate::list::TestId;
use camino::Utf8PathBuf;
use config::ConfigError;
use itertools::Itertools;
use std::{error, fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinError;

/// An error that occurred while parsing the scheduler config.
#[derive(Debug, Error)]
#[error("failed to parse scheduler config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing the scheduler config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// The minimum thread count is larger than the maximum.
    #[error("min-threads ({min}) is greater than max-threads ({max})")]
    InvalidThreadRange {
        /// The configured minimum.
        min: usize,
        /// The configured maximum.
        max: usize,
    },
}

/// Error returned while parsing a [`TestThreads`](crate::config::TestThreads) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for test-threads: {input}\n(hint: expected an integer or \"num-cpus\")")]
pub struct TestThreadsParseError {
    /// The input that failed to parse.
    pub input: String,
}

impl TestThreadsParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while parsing a [`MaxFail`](crate::config::MaxFail) input.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for max-fail: {reason}")]
pub struct MaxFailParseError {
    /// The reason parsing failed.
    pub reason: String,
}

impl MaxFailParseError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An error that occurs while building a [`TestList`](crate::list::TestList).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TestListError {
    /// Two tests were declared with the same ID.
    #[error("duplicate test ID `{id}`")]
    DuplicateTestId {
        /// The ID that appeared more than once.
        id: TestId,
    },
}

/// An error that occurred while building the scheduler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The configured parallelism range is empty.
    #[error("min-threads ({min}) is greater than max-threads ({max})")]
    InvalidThreadRange {
        /// The configured minimum.
        min: usize,
        /// The configured maximum.
        max: usize,
    },
}

/// Errors that occurred while a run was being executed.
///
/// Test failures are never reported through this type: they are recorded on
/// each test's result and counted in [`RunStats`](crate::reporter::RunStats).
#[derive(Debug)]
pub struct SchedulerExecuteErrors<E> {
    /// The first error returned by the reporting callback, if any.
    pub report_error: Option<E>,

    /// Join errors (typically panics) from the scheduler's internal tasks.
    pub join_errors: Vec<JoinError>,
}

impl<E: fmt::Display> fmt::Display for SchedulerExecuteErrors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(report_error) = &self.report_error {
            write!(f, "error reporting results: {report_error}")?;
        }

        if !self.join_errors.is_empty() {
            if self.report_error.is_some() {
                write!(f, "; ")?;
            }
            write!(
                f,
                "{} scheduler task(s) panicked or were cancelled: {}",
                self.join_errors.len(),
                self.join_errors.iter().join(", "),
            )?;
        }

        Ok(())
    }
}

impl<E: error::Error + 'static> error::Error for SchedulerExecuteErrors<E> {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        if let Some(report_error) = &self.report_error {
            Some(report_error)
        } else {
            self.join_errors
                .first()
                .map(|err| err as &(dyn error::Error + 'static))
        }
    }
}

/// The reason a test ended in the failed state.
///
/// Each test's error is recorded on its [`TestResult`](crate::list::TestResult).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TestError {
    /// The test is part of a dependency cycle and was never run.
    #[error(transparent)]
    CircularDependency(#[from] CircularDependencyError),

    /// The test exceeded its timeout.
    #[error(transparent)]
    Timeout(#[from] TestTimeoutError),

    /// The executor returned an error.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The executor panicked.
    #[error(transparent)]
    Panic(#[from] ExecutorPanicError),

    /// The executor reported a failing test.
    #[error(transparent)]
    Failed(#[from] TestFailedError),
}

/// A test participates in a dependency cycle.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error(
    "test `{test}` is part of a dependency cycle: {}",
    DisplayCycle(.cycle)
)]
pub struct CircularDependencyError {
    test: TestId,
    cycle: Vec<TestId>,
}

impl CircularDependencyError {
    pub(crate) fn new(test: TestId, cycle: Vec<TestId>) -> Self {
        Self { test, cycle }
    }

    /// Returns the test this error is attached to.
    pub fn test(&self) -> &TestId {
        &self.test
    }

    /// Returns the members of the cycle, in dependency order.
    pub fn cycle(&self) -> &[TestId] {
        &self.cycle
    }
}

struct DisplayCycle<'a>(&'a [TestId]);

impl fmt::Display for DisplayCycle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Close the loop so that `a -> b -> a` reads as a cycle.
        let closing = self.0.first();
        write!(f, "{}", self.0.iter().chain(closing).join(" -> "))
    }
}

/// A test ran past its timeout and was terminated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("test timed out after {timeout:?}")]
pub struct TestTimeoutError {
    timeout: Duration,
}

impl TestTimeoutError {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns the timeout that was exceeded.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// An error returned by a [`TestExecutor`](crate::runner::TestExecutor).
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ExecutorError {
    message: String,
    #[source]
    source: Option<Arc<dyn error::Error + Send + Sync>>,
}

impl ExecutorError {
    /// Creates a new executor error with an underlying cause.
    pub fn new(
        message: impl Into<String>,
        source: impl error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new executor error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The executor panicked while running a test.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("test executor panicked: {message}")]
pub struct ExecutorPanicError {
    message: String,
}

impl ExecutorPanicError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the panic message, if one could be extracted.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The executor reported that the test failed.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{message}")]
pub struct TestFailedError {
    message: String,
}

impl TestFailedError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Displays an error along with its chain of sources.
pub struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, "\n  caused by: {err}")?;
            source = err.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn circular_dependency_display() {
        let err = CircularDependencyError::new(
            "b".into(),
            vec!["a".into(), "b".into(), "c".into()],
        );
        assert_eq!(
            err.to_string(),
            "test `b` is part of a dependency cycle: a -> b -> c -> a",
        );

        let err = CircularDependencyError::new("a".into(), vec!["a".into()]);
        assert_eq!(
            err.to_string(),
            "test `a` is part of a dependency cycle: a -> a",
        );
    }

    #[test]
    fn display_error_chain() {
        let io_err = std::io::Error::other("disk on fire");
        let err = ExecutorError::new("setup failed", io_err);
        assert_eq!(
            DisplayErrorChain::new(&err).to_string(),
            "setup failed\n  caused by: disk on fire",
        );

        let err = ExecutorError::msg("plain");
        assert_eq!(DisplayErrorChain::new(&err).to_string(), "plain");
    }
}
