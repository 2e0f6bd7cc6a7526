// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queues connecting newly ready tests to the workers that run them.

mod imp;

pub(crate) use imp::*;
