// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Partition layout checks.

use crate::install_plan::Partition;
use crate::verifier::VerifierStep;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("hash tree offset {hash_tree_offset} beyond FEC offset {fec_offset}")]
    HashTreeBeyondFec { hash_tree_offset: u64, fec_offset: u64 },
    #[error("filesystem data end {filesystem_data_end} beyond partition size {partition_size}")]
    DataEndBeyondPartition {
        filesystem_data_end: u64,
        partition_size: u64,
    },
}

/// Determine the end of the filesystem data, i.e. of the region preceding
/// the verity metadata.
///
/// This is the hash tree's offset if any, else the FEC's offset if any,
/// else the partition's end. The source partition of a delta update may be
/// smaller than the target's layout suggests, in which case the whole
/// source partition counts as filesystem data.
pub fn filesystem_data_end(partition: &Partition, step: VerifierStep, partition_size: u64) -> Result<u64, LayoutError> {
    if partition.hash_tree_offset != 0 && partition.fec_offset != 0 && partition.hash_tree_offset > partition.fec_offset
    {
        return Err(LayoutError::HashTreeBeyondFec {
            hash_tree_offset: partition.hash_tree_offset,
            fec_offset: partition.fec_offset,
        });
    }

    let filesystem_data_end = if partition.hash_tree_offset != 0 {
        partition.hash_tree_offset
    } else if partition.fec_offset != 0 {
        partition.fec_offset
    } else {
        partition_size
    };

    if filesystem_data_end > partition_size {
        match step {
            VerifierStep::VerifySource => return Ok(partition_size),
            VerifierStep::VerifyTarget => {
                return Err(LayoutError::DataEndBeyondPartition {
                    filesystem_data_end,
                    partition_size,
                });
            }
        }
    }
    Ok(filesystem_data_end)
}
