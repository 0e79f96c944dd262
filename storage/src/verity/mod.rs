// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Computation of dm-verity metadata: the hash tree and the forward error
//! correction (FEC) region.
//!
//! The hash tree covers the partition's filesystem data and is stored
//! right behind it, in the format expected by the kernel's dm-verity
//! target. The FEC region covers both, the filesystem data and the hash
//! tree, and is compatible with what libfec expects for error correction
//! at read time.

mod fec;
pub use fec::{FecLayout, ReedSolomon};
mod hash_tree;
pub use hash_tree::{HashTree, HashTreeBuilder};
mod writer;
pub use writer::{DmVerityFinalizeFuture, DmVerityWriter};

use crate::blkdev::{PartitionIo, PartitionIoError, PartitionIoFuture};
use otaverify_crypto::CryptoError;
use std::marker;

/// dm-verity metadata parameters of a partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerityLayout {
    pub block_size: u32,

    pub hash_tree_algorithm: String,
    pub hash_tree_salt: Vec<u8>,
    /// Region covered by the hash tree.
    pub hash_tree_data_offset: u64,
    pub hash_tree_data_size: u64,
    /// Location of the hash tree.
    pub hash_tree_offset: u64,
    pub hash_tree_size: u64,

    /// Region covered by the FEC.
    pub fec_data_offset: u64,
    pub fec_data_size: u64,
    /// Location of the FEC.
    pub fec_offset: u64,
    pub fec_size: u64,
    /// Number of Reed-Solomon parity bytes per codeword.
    pub fec_roots: u32,
}

/// Error type returned by [`VerityWriter`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum VerityError {
    #[error("unsupported hash tree algorithm {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("invalid block size {0}")]
    InvalidBlockSize(u32),
    #[error("data size {data_size} not a multiple of the block size {block_size}")]
    UnalignedDataSize { data_size: u64, block_size: u32 },
    #[error("hash tree size mismatch: expected {expected}, calculated {calculated}")]
    HashTreeSizeMismatch { expected: u64, calculated: u64 },
    #[error("FEC size mismatch: expected {expected}, calculated {calculated}")]
    FecSizeMismatch { expected: u64, calculated: u64 },
    #[error("layout region at offset {offset} with size {size} out of range")]
    LayoutOutOfRange { offset: u64, size: u64 },
    #[error("invalid number of FEC roots {0}")]
    InvalidFecRoots(u32),
    #[error("non-sequential update at offset {offset}, expected offset {expected}")]
    NonSequentialUpdate { offset: u64, expected: u64 },
    #[error("update beyond the end of the hash tree data")]
    DataOverflow,
    #[error("incomplete hash tree data: {hashed} of {expected} bytes")]
    IncompleteData { hashed: u64, expected: u64 },
    #[error("verity writer not initialized")]
    NotInitialized,
    #[error("unexpected end of partition at offset {0}")]
    UnexpectedEof(u64),
    #[error("memory allocation failure")]
    MemoryAllocationFailure,
    #[error("partition IO error: {0}")]
    Io(#[from] PartitionIoError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Incremental writer of dm-verity metadata.
///
/// A `VerityWriter` gets [initialized](Self::init) for a partition, then fed
/// the partition's data in order through [`update()`](Self::update) and
/// finally [finalized](Self::finalize), which writes out the hash tree and
/// FEC. A writer may get reused for another partition by initializing it
/// again.
pub trait VerityWriter: marker::Send + marker::Unpin {
    type FinalizeFuture<D: PartitionIo>: PartitionIoFuture<D, Output = Result<(), VerityError>>
        + marker::Send
        + marker::Unpin;

    fn init(&mut self, layout: &VerityLayout) -> Result<(), VerityError>;

    /// Feed partition data at `offset`.
    ///
    /// Updates must be sequential, starting at offset zero.
    fn update(&mut self, offset: u64, data: &[u8]) -> Result<(), VerityError>;

    /// Build the metadata and obtain a future for writing it to the device.
    ///
    /// The writer is uninitialized afterwards.
    fn finalize<D: PartitionIo>(&mut self) -> Result<Self::FinalizeFuture<D>, VerityError>;
}
