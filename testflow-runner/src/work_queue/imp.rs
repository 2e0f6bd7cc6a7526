// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{classify::DispatchOrder, config::LockKey};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
};
use tracing::debug;

/// A ready test waiting in a lane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct QueueEntry {
    pub(crate) order: DispatchOrder,
    /// Index of the test in the test list.
    pub(crate) ix: usize,
    /// The lane this entry is returned to when unparked.
    pub(crate) lane: Option<LockKey>,
}

impl QueueEntry {
    pub(crate) fn new(order: DispatchOrder, ix: usize, lane: Option<LockKey>) -> Self {
        Self { order, ix, lane }
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.ix.cmp(&other.ix))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a parked entry is waiting on.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum ParkKey {
    /// A lock key held by another test.
    Lock(LockKey),
    /// Lower tiers of the named parallel group that haven't drained yet.
    TierBarrier(SmolStr),
}

#[derive(Debug, Default)]
struct Lane {
    entries: BinaryHeap<Reverse<QueueEntry>>,
    claimed_by: Option<usize>,
}

impl Lane {
    fn head(&self) -> Option<&QueueEntry> {
        self.entries.peek().map(|Reverse(entry)| entry)
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop().map(|Reverse(entry)| entry);
        if self.entries.is_empty() {
            // Draining a lane ends its claim.
            self.claimed_by = None;
        }
        entry
    }
}

/// The ready queues.
///
/// There's one lane for unconstrained tests and one per lock key. Workers claim
/// an exclusive lane when they take work from it, and keep draining that lane
/// until it's empty. Other workers only take from a claimed lane when nothing
/// else is available. Claims are affinity hints: mutual exclusion is always
/// enforced by the lock table.
///
/// Entries that can't run yet are parked against the key blocking them, and
/// put back into their lane when that key is released.
#[derive(Debug, Default)]
pub(crate) struct WorkQueues {
    unconstrained: BinaryHeap<Reverse<QueueEntry>>,
    lanes: IndexMap<LockKey, Lane>,
    parked: HashMap<ParkKey, Vec<QueueEntry>>,
}

impl WorkQueues {
    pub(crate) fn new(lane_keys: impl IntoIterator<Item = LockKey>) -> Self {
        Self {
            unconstrained: BinaryHeap::new(),
            lanes: lane_keys
                .into_iter()
                .map(|key| (key, Lane::default()))
                .collect(),
            parked: HashMap::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: QueueEntry) {
        match &entry.lane {
            Some(key) => self
                .lanes
                .entry(key.clone())
                .or_default()
                .entries
                .push(Reverse(entry)),
            None => self.unconstrained.push(Reverse(entry)),
        }
    }

    /// Takes the next entry for `worker`.
    ///
    /// In order of preference: the lane this worker has claimed, then the best
    /// head among the unconstrained lane and unclaimed lanes (ties go to
    /// unconstrained work), then a lane claimed by another worker.
    pub(crate) fn pop(&mut self, worker: usize) -> Option<QueueEntry> {
        if let Some(lane) = self
            .lanes
            .values_mut()
            .find(|lane| lane.claimed_by == Some(worker))
        {
            if let Some(entry) = lane.pop() {
                return Some(entry);
            }
        }

        let best_lane = self
            .lanes
            .iter()
            .filter(|(_, lane)| lane.claimed_by.is_none())
            .filter_map(|(key, lane)| lane.head().map(|head| (key, head)))
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(key, head)| (key.clone(), head.order));
        let unconstrained_order = self.unconstrained.peek().map(|Reverse(entry)| entry.order);

        let lane_key = match (unconstrained_order, best_lane) {
            (Some(order), Some((key, lane_order))) => (lane_order < order).then_some(key),
            (Some(_), None) => None,
            (None, Some((key, _))) => Some(key),
            (None, None) => return self.steal(worker),
        };
        let Some(key) = lane_key else {
            return self.unconstrained.pop().map(|Reverse(entry)| entry);
        };
        let lane = self.lanes.get_mut(&key)?;
        let entry = lane.pop();
        if !key.is_shared() && !lane.entries.is_empty() {
            lane.claimed_by = Some(worker);
        }
        entry
    }

    fn steal(&mut self, worker: usize) -> Option<QueueEntry> {
        // Take from the fullest lane claimed by someone else.
        let (key, lane) = self
            .lanes
            .iter_mut()
            .filter(|(_, lane)| !lane.entries.is_empty())
            .max_by_key(|(_, lane)| lane.entries.len())?;
        debug!(worker, lane = %key, claimed_by = ?lane.claimed_by, "stealing from claimed lane");
        lane.pop()
    }

    pub(crate) fn park(&mut self, key: ParkKey, entry: QueueEntry) {
        self.parked.entry(key).or_default().push(entry);
    }

    /// Returns every entry parked on `key` to its lane, and returns how many
    /// were moved.
    pub(crate) fn unpark(&mut self, key: &ParkKey) -> usize {
        let Some(entries) = self.parked.remove(key) else {
            return 0;
        };
        let count = entries.len();
        for entry in entries {
            self.push(entry);
        }
        count
    }

    /// The number of entries ready to be taken, excluding parked ones.
    pub(crate) fn ready_len(&self) -> usize {
        self.unconstrained.len()
            + self
                .lanes
                .values()
                .map(|lane| lane.entries.len())
                .sum::<usize>()
    }

    #[cfg(test)]
    pub(crate) fn parked_len(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    /// Drops every queued and parked entry, returning their test indexes.
    pub(crate) fn drain(&mut self) -> Vec<usize> {
        let mut ixs: Vec<usize> = self
            .unconstrained
            .drain()
            .map(|Reverse(entry)| entry.ix)
            .collect();
        for lane in self.lanes.values_mut() {
            ixs.extend(lane.entries.drain().map(|Reverse(entry)| entry.ix));
            lane.claimed_by = None;
        }
        for (_, entries) in self.parked.drain() {
            ixs.extend(entries.into_iter().map(|entry| entry.ix));
        }
        ixs.sort_unstable();
        ixs
    }
}
