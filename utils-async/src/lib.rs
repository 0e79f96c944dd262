// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Rust async related utilities.

pub mod asynchronous;

pub mod test;
