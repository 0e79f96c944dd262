// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Partition IO and dm-verity metadata computation.

pub mod blkdev;
pub mod dynamic_partition;
pub mod verity;
