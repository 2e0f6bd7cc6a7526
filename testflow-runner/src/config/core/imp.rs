// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{
        AdaptiveConfig, MaxFail, SchedulingStrategy, TestThreads, elements::deserialize_fail_fast,
    },
    errors::{ConfigParseError, ConfigParseErrorKind},
};
use camino::Utf8Path;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, sync::LazyLock, time::Duration};
use tracing::warn;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Run-wide scheduler configuration.
///
/// Obtained either from [`SchedulerConfig::default`], which uses the embedded
/// `default-config.toml`, or by layering a TOML file on top of those defaults
/// with [`SchedulerConfig::from_file`].
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    strategy: SchedulingStrategy,
    test_threads: TestThreads,
    min_threads: usize,
    #[serde(default)]
    max_threads: Option<TestThreads>,
    #[serde(with = "humantime_serde")]
    test_timeout: Duration,
    #[serde(with = "humantime_serde")]
    stall_timeout: Duration,
    #[serde(deserialize_with = "deserialize_fail_fast")]
    fail_fast: MaxFail,
    metrics_logging: bool,
    adaptive: AdaptiveConfig,
}

/// The resolved bounds on concurrency for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadLimits {
    /// The adaptive controller never goes below this.
    pub min: usize,
    /// The limit the run starts with.
    pub initial: usize,
    /// The adaptive controller never goes above this. Also the size of the
    /// worker pool.
    pub max: usize,
}

impl ThreadLimits {
    /// Creates a new set of limits, normalizing them so that
    /// `1 <= min <= initial <= max`.
    pub fn new(min: usize, initial: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            min,
            initial: initial.clamp(min, max),
            max,
        }
    }

    /// Limits for a fixed-size run.
    pub fn fixed(threads: usize) -> Self {
        Self::new(threads, threads, threads)
    }
}

impl SchedulerConfig {
    /// The embedded default configuration.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../../default-config.toml");

    /// Reads the config file at `config_file`, layered over the defaults.
    ///
    /// Unknown keys are reported as warnings.
    pub fn from_file(config_file: &Utf8Path) -> Result<Self, ConfigParseError> {
        let builder = Self::make_default_config()
            .add_source(File::new(config_file.as_str(), FileFormat::Toml));
        Self::load(config_file, &builder)
    }

    /// Parses `toml` as a config file, layered over the defaults.
    ///
    /// `source_name` is used in error messages.
    pub fn from_toml_str(source_name: &Utf8Path, toml: &str) -> Result<Self, ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(toml, FileFormat::Toml));
        Self::load(source_name, &builder)
    }

    fn load(
        source_name: &Utf8Path,
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<Self, ConfigParseError> {
        let (config, ignored) = Self::build_and_deserialize_config(builder)
            .map_err(|kind| ConfigParseError::new(source_name, kind))?;
        for path in &ignored {
            warn!("ignoring unknown configuration key `{path}` in {source_name}");
        }
        config
            .validate()
            .map_err(|kind| ConfigParseError::new(source_name, kind))?;
        Ok(config)
    }

    /// Returns the scheduling strategy.
    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Returns the initial concurrency limit as configured.
    pub fn test_threads(&self) -> TestThreads {
        self.test_threads
    }

    /// Returns the default per-test timeout.
    pub fn test_timeout(&self) -> Duration {
        self.test_timeout
    }

    /// Returns the stall timeout. Zero means stall detection is off.
    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Returns the max-fail policy.
    pub fn max_fail(&self) -> MaxFail {
        self.fail_fast
    }

    /// Returns true if adjustments and periodic metrics are logged.
    pub fn metrics_logging(&self) -> bool {
        self.metrics_logging
    }

    /// Returns the adaptive controller tuning.
    pub fn adaptive(&self) -> &AdaptiveConfig {
        &self.adaptive
    }

    /// Resolves the concurrency bounds for a run.
    ///
    /// In fixed mode every bound is `test-threads`. In adaptive mode
    /// `max-threads` defaults to four times `test-threads`.
    pub fn thread_limits(&self) -> ThreadLimits {
        let initial = self.test_threads.compute();
        match self.strategy {
            SchedulingStrategy::Fixed => ThreadLimits::fixed(initial),
            SchedulingStrategy::Adaptive => {
                let max = self
                    .max_threads
                    .map_or(initial.saturating_mul(4), TestThreads::compute);
                ThreadLimits::new(self.min_threads, initial, max)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigParseErrorKind> {
        if let Some(max) = self.max_threads {
            let max = max.compute();
            if self.min_threads > max {
                return Err(ConfigParseErrorKind::InvalidThreadRange {
                    min: self.min_threads,
                    max,
                });
            }
        }
        Ok(())
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(Self, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: Self = serde_path_to_error::deserialize(ignored_de).map_err(|error| {
            // The config crate also reports the key. Drop it from the inner
            // error so it isn't printed twice.
            let path = error.path().clone();
            let error = match error.into_inner() {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })?;

        Ok((config, ignored))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        // The embedded defaults are checked by tests, so failing to parse them
        // is a build defect.
        Self::build_and_deserialize_config(&Self::make_default_config())
            .map(|(config, _)| config)
            .unwrap_or_else(|err| panic!("embedded default config is invalid: {err}"))
    }
}
