// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Deserializer};

/// A test priority. Higher priorities are dispatched first.
///
/// The sort order is from highest to lowest priority.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TestPriority(i32);

impl TestPriority {
    /// Creates a new `TestPriority`.
    pub fn new(priority: i32) -> Self {
        Self(priority)
    }

    /// Returns the priority as an `i32`.
    pub fn to_i32(self) -> i32 {
        self.0
    }
}

impl PartialOrd for TestPriority {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TestPriority {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the order to sort from highest to lowest priority.
        other.0.cmp(&self.0)
    }
}

impl<'de> Deserialize<'de> for TestPriority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        i32::deserialize(deserializer).map(TestPriority)
    }
}
