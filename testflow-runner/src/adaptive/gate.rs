// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tracing::debug;

/// A counting gate whose limit can change while permits are held.
///
/// Growing the limit releases queued waiters at once. Shrinking it forgets as
/// many idle permits as possible and records the rest as debt: permits
/// returned while there's debt are retired instead of being handed to the next
/// waiter. Holders are never preempted.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    state: Mutex<GateState>,
}

#[derive(Debug)]
struct GateState {
    limit: usize,
    debt: usize,
}

impl ConcurrencyGate {
    /// Creates a new gate with the given limit.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Semaphore::new(limit),
            state: Mutex::new(GateState { limit, debt: 0 }),
        }
    }

    /// Returns the current limit.
    pub fn limit(&self) -> usize {
        self.state().limit
    }

    /// Returns the number of permits that can be acquired without waiting.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a permit.
    ///
    /// Fails only if the gate has been closed.
    pub async fn acquire(&self) -> Result<GatePermit<'_>, AcquireError> {
        let permit = self.semaphore.acquire().await?;
        Ok(GatePermit {
            gate: self,
            permit: Some(permit),
        })
    }

    /// Changes the limit.
    pub fn set_limit(&self, new_limit: usize) {
        let mut state = self.state();
        let old_limit = state.limit;
        if new_limit > old_limit {
            let grow = new_limit - old_limit;
            let repaid = grow.min(state.debt);
            state.debt -= repaid;
            self.semaphore.add_permits(grow - repaid);
        } else if new_limit < old_limit {
            let shrink = old_limit - new_limit;
            let forgotten = self.semaphore.forget_permits(shrink);
            state.debt += shrink - forgotten;
        }
        state.limit = new_limit;
        debug!(old_limit, new_limit, debt = state.debt, "concurrency gate resized");
    }

    /// Closes the gate, failing all current and future waiters.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A permit from a [`ConcurrencyGate`], returned on drop.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a ConcurrencyGate,
    permit: Option<SemaphorePermit<'a>>,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut state = self.gate.state();
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        } else {
            // Return the permit with the state lock held, so a concurrent
            // resize sees it.
            drop(permit);
        }
    }
}
