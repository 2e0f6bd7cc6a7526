// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::lock_table::ConstraintLockTable;
use crate::{
    adaptive::WorkerGauge,
    classify::{ConstraintPartitions, DispatchOrder},
    config::{Constraint, LockKey},
    list::{ExecutableTest, TestList, TestResult, TestState},
    plan::ExecutionPlan,
    reporter::SkipReason,
    work_queue::{ParkKey, QueueEntry, WorkQueues},
};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, HashMap},
    pin::pin,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scheduling bookkeeping shared by every worker.
///
/// All mutable state sits behind one mutex, held only for short
/// read-modify-write sections and never across an executor call. Workers
/// waiting for work are woken through `notify`.
#[derive(Debug)]
pub(super) struct SchedulerState<'s, 'a> {
    plan: &'s ExecutionPlan<'a>,
    gauge: &'s WorkerGauge,
    core: Mutex<StateCore>,
    notify: Notify,
    done: CancellationToken,
}

#[derive(Debug)]
struct StateCore {
    units: Vec<UnitState>,
    locks: ConstraintLockTable,
    queues: WorkQueues,
    /// Remaining (not yet finished) tests per tier, per parallel group.
    tiers: HashMap<SmolStr, BTreeMap<i32, usize>>,
    completed: usize,
    cancelled: bool,
}

#[derive(Debug)]
struct UnitState {
    /// Dependencies that haven't finished yet.
    remaining: usize,
    /// The first dependency that finished without passing, on an edge that
    /// doesn't allow proceeding.
    dependency_failure: Option<(usize, TestState)>,
    phase: UnitPhase,
    order: DispatchOrder,
    lock_keys: SmallVec<[LockKey; 2]>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum UnitPhase {
    Waiting,
    Queued,
    Running,
    Finished,
}

/// What a worker should do next.
#[derive(Debug, Eq, PartialEq)]
enum Next {
    Test(usize),
    Wait,
    Done,
}

impl<'s, 'a> SchedulerState<'s, 'a> {
    pub(super) fn new(
        plan: &'s ExecutionPlan<'a>,
        partitions: &ConstraintPartitions<'a>,
        gauge: &'s WorkerGauge,
    ) -> Self {
        let test_list = plan.test_list();
        let units = test_list
            .iter()
            .enumerate()
            .map(|(ix, test)| UnitState {
                remaining: plan.dependency_edges(ix).len(),
                dependency_failure: None,
                phase: UnitPhase::Waiting,
                order: DispatchOrder::new(test, plan.rank_of(ix)),
                lock_keys: test.constraint().lock_keys(),
            })
            .collect();

        let mut lane_keys = Vec::new();
        if !partitions.exclusive_global.is_empty() {
            lane_keys.push(LockKey::Global);
        }
        lane_keys.extend(partitions.exclusive_keyed.keys().cloned().map(LockKey::Keyed));
        lane_keys.extend(partitions.parallel_groups.keys().cloned().map(LockKey::Group));

        let tiers = partitions
            .parallel_groups
            .keys()
            .map(|name| (name.clone(), partitions.tier_sizes(name)))
            .collect();

        Self {
            plan,
            gauge,
            core: Mutex::new(StateCore {
                units,
                locks: ConstraintLockTable::default(),
                queues: WorkQueues::new(lane_keys),
                tiers,
                completed: 0,
                cancelled: false,
            }),
            notify: Notify::new(),
            done: CancellationToken::new(),
        }
    }

    pub(super) fn test_list(&self) -> &'a TestList {
        self.plan.test_list()
    }

    /// A token that fires once every test has reached a terminal state.
    pub(super) fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Accounts for tests failed while planning and enqueues every test
    /// without dependencies.
    ///
    /// Returns the tests skipped because they depend on a failed cycle member.
    pub(super) fn seed(&self) -> Vec<(&'a ExecutableTest, SkipReason)> {
        let mut core = self.core();
        let mut skipped = Vec::new();

        for &ix in self.plan.cycle_failed_indexes() {
            core.units[ix].phase = UnitPhase::Finished;
            core.completed += 1;
        }
        for &ix in self.plan.cycle_failed_indexes() {
            self.resolve_dependents(&mut core, ix, TestState::Failed, &mut skipped);
        }

        for &ix in self.plan.executable_indexes() {
            let unit = &core.units[ix];
            if unit.phase == UnitPhase::Waiting && unit.remaining == 0 {
                self.enqueue(&mut core, ix);
            }
        }

        debug!(
            ready = core.queues.ready_len(),
            cycle_failed = self.plan.cycle_failed_indexes().len(),
            skipped = skipped.len(),
            "scheduler seeded",
        );
        self.after_update(&core);
        skipped
    }

    /// Waits for the next test `worker` should run.
    ///
    /// On success, the test's constraint keys are held and its state is
    /// running. Returns `None` once the run is done or cancelled.
    pub(super) async fn next_test(&self, worker: usize) -> Option<usize> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before checking, so that a notification sent between
            // the check and the await isn't lost.
            notified.as_mut().enable();

            match self.try_next(worker) {
                Next::Test(ix) => return Some(ix),
                Next::Done => return None,
                Next::Wait => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.done.cancelled() => return None,
                    }
                }
            }
        }
    }

    fn try_next(&self, worker: usize) -> Next {
        let mut guard = self.core();
        let core = &mut *guard;
        if core.cancelled || core.completed == core.units.len() {
            return Next::Done;
        }

        let test_list = self.plan.test_list();
        let next = loop {
            let Some(entry) = core.queues.pop(worker) else {
                break Next::Wait;
            };
            let ix = entry.ix;

            if let Constraint::ParallelGroup { name, order } = test_list.by_index(ix).constraint() {
                let lower_tiers_pending = core
                    .tiers
                    .get(name)
                    .is_some_and(|tiers| tiers.range(..*order).any(|(_, &count)| count > 0));
                if lower_tiers_pending {
                    core.queues.park(ParkKey::TierBarrier(name.clone()), entry);
                    continue;
                }
            }

            match core.locks.try_acquire(&core.units[ix].lock_keys) {
                Ok(()) => {
                    core.units[ix].phase = UnitPhase::Running;
                    test_list.by_index(ix).set_state(TestState::Running);
                    break Next::Test(ix);
                }
                Err(blocking) => {
                    core.queues.park(ParkKey::Lock(blocking), entry);
                }
            }
        };

        self.gauge.set_pending(core.queues.ready_len());
        next
    }

    /// Records that a running test reached `state`.
    ///
    /// Releases its keys and resolves its dependents. Returns the tests that
    /// were skipped as a result, in the order they were decided.
    pub(super) fn complete(
        &self,
        ix: usize,
        state: TestState,
    ) -> Vec<(&'a ExecutableTest, SkipReason)> {
        let mut guard = self.core();
        let core = &mut *guard;

        let freed = core.locks.release(&core.units[ix].lock_keys);
        for key in freed {
            core.queues.unpark(&ParkKey::Lock(key));
        }
        self.finish_unit(core, ix);

        let mut skipped = Vec::new();
        self.resolve_dependents(core, ix, state, &mut skipped);
        self.after_update(core);
        skipped
    }

    /// Cancels every test that hasn't started yet.
    ///
    /// Running tests are left alone. Returns the cancelled tests, in list
    /// order.
    pub(super) fn cancel_pending(&self) -> Vec<&'a ExecutableTest> {
        let mut guard = self.core();
        let core = &mut *guard;
        core.cancelled = true;
        let dropped = core.queues.drain();

        let test_list = self.plan.test_list();
        let mut cancelled = Vec::new();
        for (ix, unit) in core.units.iter_mut().enumerate() {
            if matches!(unit.phase, UnitPhase::Waiting | UnitPhase::Queued) {
                unit.phase = UnitPhase::Finished;
                let test = test_list.by_index(ix);
                test.finish(TestResult::not_run(TestState::Cancelled));
                cancelled.push(test);
            }
        }
        core.completed += cancelled.len();

        debug!(
            cancelled = cancelled.len(),
            queued = dropped.len(),
            "pending tests cancelled",
        );
        self.after_update(core);
        cancelled
    }

    fn enqueue(&self, core: &mut StateCore, ix: usize) {
        let test = self.plan.test_list().by_index(ix);
        let unit = &mut core.units[ix];
        unit.phase = UnitPhase::Queued;
        test.set_state(TestState::Ready);
        core.queues
            .push(QueueEntry::new(unit.order, ix, test.constraint().lane_key()));
    }

    /// Marks an executable test finished, and lifts its group's tier barrier
    /// if its tier has drained.
    fn finish_unit(&self, core: &mut StateCore, ix: usize) {
        core.units[ix].phase = UnitPhase::Finished;
        core.completed += 1;

        if let Constraint::ParallelGroup { name, order } =
            self.plan.test_list().by_index(ix).constraint()
        {
            let Some(count) = core
                .tiers
                .get_mut(name)
                .and_then(|tiers| tiers.get_mut(order))
            else {
                return;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                debug!(group = %name, tier = order, "parallel group tier drained");
                core.queues.unpark(&ParkKey::TierBarrier(name.clone()));
            }
        }
    }

    /// Notifies the dependents of `ix`, which just finished in `state`.
    ///
    /// Dependents whose last dependency resolved become ready, or are skipped
    /// if a dependency they can't proceed without didn't pass. Skips are
    /// propagated through a worklist.
    fn resolve_dependents(
        &self,
        core: &mut StateCore,
        ix: usize,
        state: TestState,
        skipped: &mut Vec<(&'a ExecutableTest, SkipReason)>,
    ) {
        let test_list = self.plan.test_list();
        let mut worklist = vec![(ix, state)];

        while let Some((finished_ix, finished_state)) = worklist.pop() {
            for &dependent in self.plan.dependent_indexes(finished_ix) {
                let proceed_on_failure = self
                    .plan
                    .dependency_edges(dependent)
                    .iter()
                    .find(|edge| edge.test == finished_ix)
                    .is_some_and(|edge| edge.proceed_on_failure);

                let unit = &mut core.units[dependent];
                // Cycle members and cancelled tests are already finished.
                if unit.phase != UnitPhase::Waiting {
                    continue;
                }
                if finished_state != TestState::Passed
                    && !proceed_on_failure
                    && unit.dependency_failure.is_none()
                {
                    unit.dependency_failure = Some((finished_ix, finished_state));
                }
                unit.remaining -= 1;
                if unit.remaining > 0 {
                    continue;
                }

                match unit.dependency_failure {
                    Some((failed_ix, failed_state)) => {
                        let reason = SkipReason::DependencyFailed {
                            dependency: test_list.by_index(failed_ix).id().clone(),
                            state: failed_state,
                        };
                        let test = test_list.by_index(dependent);
                        debug!(test = %test.id(), %reason, "skipping test");
                        test.finish(TestResult {
                            skip_reason: Some(reason.clone()),
                            ..TestResult::not_run(TestState::Skipped)
                        });
                        self.finish_unit(core, dependent);
                        skipped.push((test, reason));
                        worklist.push((dependent, TestState::Skipped));
                    }
                    None => self.enqueue(core, dependent),
                }
            }
        }
    }

    fn after_update(&self, core: &StateCore) {
        self.gauge.set_pending(core.queues.ready_len());
        self.gauge.set_completed(core.completed);
        if core.completed == core.units.len() {
            self.done.cancel();
        }
        self.notify.notify_waiters();
    }

    fn core(&self) -> MutexGuard<'_, StateCore> {
        // Every section leaves the core consistent before anything that can
        // panic, so a poisoned lock is still usable.
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
