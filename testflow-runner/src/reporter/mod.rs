// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events handed to the reporting collaborator.
//!
//! The scheduler doesn't format or persist anything itself. Instead, every
//! state transition is turned into a [`TestEvent`] and passed to the callback
//! given to [`TestScheduler::execute`](crate::runner::TestScheduler::execute).

/// Event and run statistics types.
pub mod events;

pub use events::*;
