// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::LockKey;
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::warn;

/// Tracks how many running tests hold each constraint key.
///
/// * Exclusive keys (global and user-declared) have at most one holder.
/// * Group keys may have any number of holders, but at most one group is
///   active at a time.
#[derive(Debug, Default)]
pub(super) struct ConstraintLockTable {
    holders: HashMap<LockKey, usize>,
    active_group: Option<LockKey>,
}

impl ConstraintLockTable {
    /// Acquires every key in `keys`, or none of them.
    ///
    /// On failure, returns the key that blocked acquisition. That's the key to
    /// wait on: once it's released the acquisition may succeed.
    pub(super) fn try_acquire(&mut self, keys: &[LockKey]) -> Result<(), LockKey> {
        for key in keys {
            if key.is_shared() {
                if let Some(active) = &self.active_group {
                    if active != key {
                        return Err(active.clone());
                    }
                }
            } else if self.holders(key) > 0 {
                return Err(key.clone());
            }
        }

        for key in keys {
            *self.holders.entry(key.clone()).or_default() += 1;
            if key.is_shared() {
                self.active_group = Some(key.clone());
            }
        }
        Ok(())
    }

    /// Releases every key in `keys`, returning the ones that are now free.
    pub(super) fn release(&mut self, keys: &[LockKey]) -> SmallVec<[LockKey; 2]> {
        let mut freed = SmallVec::new();
        for key in keys {
            let Some(count) = self.holders.get_mut(key) else {
                warn!(%key, "released a constraint key that was never held");
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.holders.remove(key);
                if self.active_group.as_ref() == Some(key) {
                    self.active_group = None;
                }
                freed.push(key.clone());
            }
        }
        freed
    }

    pub(super) fn holders(&self, key: &LockKey) -> usize {
        self.holders.get(key).copied().unwrap_or(0)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.active_group.is_none()
    }
}
