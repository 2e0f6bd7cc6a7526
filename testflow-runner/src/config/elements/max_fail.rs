// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::MaxFailParseError;
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// How many failures a run tolerates before it is cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MaxFail {
    /// Cancel the run once this many tests have failed.
    Count {
        /// The number of failures that triggers cancellation.
        max_fail: usize,
        /// What happens to tests that are still running at that point.
        terminate: TerminateMode,
    },

    /// Never cancel the run because of failures.
    All,
}

impl MaxFail {
    /// Returns the max-fail corresponding to a fail-fast flag.
    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            Self::Count {
                max_fail: 1,
                terminate: TerminateMode::Wait,
            }
        } else {
            Self::All
        }
    }

    /// Returns the terminate mode if `failed` failures exceed the limit.
    pub fn is_exceeded(&self, failed: usize) -> Option<TerminateMode> {
        match self {
            Self::Count {
                max_fail,
                terminate,
            } => (failed >= *max_fail).then_some(*terminate),
            Self::All => None,
        }
    }
}

impl FromStr for MaxFail {
    type Err = MaxFailParseError;

    /// Parses `all`, `N`, or `N:wait` / `N:immediate`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let (count, terminate) = match s.split_once(':') {
            Some((count, mode)) => (count, mode.parse()?),
            None => (s, TerminateMode::default()),
        };

        let max_fail = count
            .parse::<isize>()
            .map_err(|err| MaxFailParseError::new(format!("{err} parsing '{count}'")))?;
        if max_fail <= 0 {
            return Err(MaxFailParseError::new("max-fail may not be <= 0"));
        }

        Ok(Self::Count {
            max_fail: max_fail as usize,
            terminate,
        })
    }
}

impl fmt::Display for MaxFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Count {
                max_fail,
                terminate: TerminateMode::Wait,
            } => write!(f, "{max_fail}"),
            Self::Count {
                max_fail,
                terminate,
            } => write!(f, "{max_fail}:{terminate}"),
        }
    }
}

/// What to do with running tests once the max-fail limit is hit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateMode {
    /// Let running tests finish, then report them as cancelled.
    #[default]
    Wait,

    /// Drop running tests right away and report them as cancelled.
    Immediate,
}

impl fmt::Display for TerminateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Immediate => write!(f, "immediate"),
        }
    }
}

impl FromStr for TerminateMode {
    type Err = MaxFailParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "immediate" => Ok(Self::Immediate),
            other => Err(MaxFailParseError::new(format!(
                "invalid terminate mode '{other}', expected 'wait' or 'immediate'"
            ))),
        }
    }
}

/// Deserializes the `fail-fast` key: a boolean, a max-fail string, or
/// `{ max-fail = ..., terminate = ... }`.
pub(in crate::config) fn deserialize_fail_fast<'de, D>(deserializer: D) -> Result<MaxFail, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;

    impl<'de2> serde::de::Visitor<'de2> for V {
        type Value = MaxFail;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "a boolean, a max-fail string, or {{ max-fail = ... }}"
            )
        }

        fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(MaxFail::from_fail_fast(v))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            MaxFail::from_str(v).map_err(E::custom)
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de2>,
        {
            let de = serde::de::value::MapAccessDeserializer::new(map);
            let helper = FailFastMap::deserialize(de)?;
            Ok(match helper.max_fail {
                MaxFailCount::Count(max_fail) => MaxFail::Count {
                    max_fail,
                    terminate: helper.terminate,
                },
                MaxFailCount::All => MaxFail::All,
            })
        }
    }

    deserializer.deserialize_any(V)
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FailFastMap {
    max_fail: MaxFailCount,
    #[serde(default)]
    terminate: TerminateMode,
}

#[derive(Clone, Copy, Debug)]
enum MaxFailCount {
    Count(usize),
    All,
}

impl<'de> Deserialize<'de> for MaxFailCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = MaxFailCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a positive integer or the string \"all\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.eq_ignore_ascii_case("all") {
                    Ok(MaxFailCount::All)
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Str(v), &self))
                }
            }

            // TOML integers are i64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v > 0 {
                    Ok(MaxFailCount::Count(v as usize))
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Signed(v), &self))
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}
