// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for the scheduler.

mod adaptive;
mod constraint;
mod max_fail;
mod priority;
mod test_threads;

pub use adaptive::*;
pub use constraint::*;
pub use max_fail::*;
pub use priority::*;
pub use test_threads::*;
