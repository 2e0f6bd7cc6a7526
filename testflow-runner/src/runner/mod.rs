// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduler.
//!
//! The main structure in this module is [`TestScheduler`].

mod dispatcher;
mod executor;
mod imp;
mod internal_events;
mod lock_table;
mod state;

use dispatcher::*;
pub use executor::{ExecuteContext, ExecutionResult, TestExecutor};
pub use imp::*;
use internal_events::*;
