// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use smallvec::SmallVec;
use smol_str::SmolStr;
use std::{collections::BTreeSet, fmt};

/// A rule restricting which tests may run at the same time as a given test.
///
/// A test has at most one constraint.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Constraint {
    /// The test may run alongside any other test.
    #[default]
    Unconstrained,

    /// The test must not run alongside any other globally exclusive test.
    ExclusiveGlobal {
        /// Position among the other globally exclusive tests. Tests without an
        /// order run after those with one.
        order: Option<i32>,
    },

    /// The test must not run alongside any other test sharing one of its keys.
    ///
    /// Construct this through [`Constraint::not_in_parallel`], which
    /// normalizes an empty key set to [`Constraint::ExclusiveGlobal`].
    ExclusiveKeyed {
        /// The mutual-exclusion keys. Never empty.
        keys: BTreeSet<SmolStr>,
        /// Position among the other tests sharing these keys.
        order: Option<i32>,
    },

    /// The test belongs to a named parallel group.
    ///
    /// Members of the same group may run together if they share a tier. Tiers
    /// within a group run in ascending order, and different groups never run
    /// at the same time.
    ParallelGroup {
        /// The group name.
        name: SmolStr,
        /// The tier within the group.
        order: i32,
    },
}

impl Constraint {
    /// Creates a not-in-parallel constraint over the given keys.
    ///
    /// With no keys, the test is exclusive with every other globally exclusive
    /// test.
    pub fn not_in_parallel<I>(keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<SmolStr>,
    {
        let keys: BTreeSet<SmolStr> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            Self::ExclusiveGlobal { order: None }
        } else {
            Self::ExclusiveKeyed { keys, order: None }
        }
    }

    /// Creates a parallel-group constraint.
    pub fn parallel_group(name: impl Into<SmolStr>, order: i32) -> Self {
        Self::ParallelGroup {
            name: name.into(),
            order,
        }
    }

    /// Sets the declared order for an exclusive constraint.
    ///
    /// Has no effect on other constraint kinds: a parallel group's order is
    /// its tier, set at construction.
    pub fn with_order(mut self, new_order: i32) -> Self {
        match &mut self {
            Self::ExclusiveGlobal { order } | Self::ExclusiveKeyed { order, .. } => {
                *order = Some(new_order);
            }
            Self::Unconstrained | Self::ParallelGroup { .. } => {}
        }
        self
    }

    /// Returns the declared order within the constraint's partition.
    pub fn declared_order(&self) -> Option<i32> {
        match self {
            Self::Unconstrained => None,
            Self::ExclusiveGlobal { order } | Self::ExclusiveKeyed { order, .. } => *order,
            Self::ParallelGroup { order, .. } => Some(*order),
        }
    }

    /// Returns the lock keys that must be held while this test runs.
    pub fn lock_keys(&self) -> SmallVec<[LockKey; 2]> {
        match self {
            Self::Unconstrained => SmallVec::new(),
            Self::ExclusiveGlobal { .. } => smallvec::smallvec![LockKey::Global],
            Self::ExclusiveKeyed { keys, .. } => {
                keys.iter().cloned().map(LockKey::Keyed).collect()
            }
            Self::ParallelGroup { name, .. } => smallvec::smallvec![LockKey::Group(name.clone())],
        }
    }

    /// Returns the key of the lane this test is queued in.
    ///
    /// Tests with several keys are queued under the first one. The lock table
    /// still checks all of them.
    pub fn lane_key(&self) -> Option<LockKey> {
        match self {
            Self::Unconstrained => None,
            Self::ExclusiveGlobal { .. } => Some(LockKey::Global),
            Self::ExclusiveKeyed { keys, .. } => keys.first().cloned().map(LockKey::Keyed),
            Self::ParallelGroup { name, .. } => Some(LockKey::Group(name.clone())),
        }
    }
}

/// A key in the constraint lock table.
///
/// User-declared keys and the synthetic keys for global exclusion and parallel
/// groups are distinct variants, so a user key can never alias a synthetic one.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LockKey {
    /// The key shared by all globally exclusive tests.
    Global,

    /// A user-declared mutual-exclusion key.
    Keyed(SmolStr),

    /// The key for a parallel group.
    Group(SmolStr),
}

impl LockKey {
    /// Returns true if several holders with this same key may coexist.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Group(_))
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "__global__"),
            Self::Keyed(key) => write!(f, "{key}"),
            Self::Group(name) => write!(f, "__group:{name}__"),
        }
    }
}
