// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Interface to the dynamic partition and snapshot controller.

use crate::blkdev::{PartitionIo, PartitionIoError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A boot slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(pub u32);

impl Slot {
    /// Marker for "no slot", e.g. the source slot of a full update.
    pub const INVALID: Slot = Slot(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("A"),
            1 => f.write_str("B"),
            u32::MAX => f.write_str("INVALID"),
            n => write!(f, "{}", n),
        }
    }
}

/// Controller for dynamic partitions living in a shared super partition,
/// possibly updated through compressed copy-on-write snapshots.
pub trait DynamicPartitionControl {
    /// Device type for copy-on-write snapshot access.
    type CowDevice: PartitionIo;

    /// Whether the update in progress gets applied through compressed
    /// snapshots.
    fn update_uses_snapshot_compression(&self) -> bool;

    fn is_dynamic_partition(&self, partition_name: &str, slot: Slot) -> bool;

    /// Map all of the target slot's partitions.
    ///
    /// Returns `false` on failure.
    fn map_all_partitions(&self) -> bool;

    /// Unmap all of the target slot's partitions.
    ///
    /// Returns `false` on failure.
    fn unmap_all_partitions(&self) -> bool;

    /// Open a raw handle on a partition's copy-on-write snapshot.
    ///
    /// Reads are resolved against the snapshot and the `source_path` it is
    /// based on.
    fn open_cow_device(
        &self,
        partition_name: &str,
        source_path: &str,
        writable: bool,
    ) -> Result<Self::CowDevice, PartitionIoError>;

    /// Verify that the extents of partitions not touched by the update
    /// are identical in the source and target slot.
    fn verify_extents_for_untouched_partitions(
        &self,
        source_slot: Slot,
        target_slot: Slot,
        partitions: &[String],
    ) -> bool;
}

/// [`DynamicPartitionControl`] implementation for devices without dynamic
/// partitions.
pub struct DynamicPartitionControlStub<D: PartitionIo> {
    _phantom: std::marker::PhantomData<fn() -> D>,
}

impl<D: PartitionIo> DynamicPartitionControlStub<D> {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<D: PartitionIo> Default for DynamicPartitionControlStub<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: PartitionIo> DynamicPartitionControl for DynamicPartitionControlStub<D> {
    type CowDevice = D;

    fn update_uses_snapshot_compression(&self) -> bool {
        false
    }

    fn is_dynamic_partition(&self, _partition_name: &str, _slot: Slot) -> bool {
        false
    }

    fn map_all_partitions(&self) -> bool {
        false
    }

    fn unmap_all_partitions(&self) -> bool {
        false
    }

    fn open_cow_device(
        &self,
        _partition_name: &str,
        _source_path: &str,
        _writable: bool,
    ) -> Result<Self::CowDevice, PartitionIoError> {
        Err(PartitionIoError::OperationNotSupported)
    }

    fn verify_extents_for_untouched_partitions(
        &self,
        _source_slot: Slot,
        _target_slot: Slot,
        _partitions: &[String],
    ) -> bool {
        true
    }
}
