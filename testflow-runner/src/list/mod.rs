// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The set of tests handed to the scheduler.
//!
//! The main data structures in this module are:
//! * [`ExecutableTest`] for a single unit of work
//! * [`TestList`] for the collection of units that make up a run

mod test_list;

pub use test_list::*;
