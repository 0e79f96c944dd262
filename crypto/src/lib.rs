// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Cryptographic primitives used for verifying partition images.

pub mod hash;

/// Error type returned by the cryptographic primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("internal error")]
    Internal,
    #[error("unsupported hash algorithm")]
    UnsupportedAlgorithm,
    #[error("invalid digest length")]
    InvalidDigestLength,
}
