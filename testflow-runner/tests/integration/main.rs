// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod basic;
mod cancellation;
mod constraints;
mod fixtures;
