// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Incremental hash calculation.

use crate::CryptoError;
use digest::Digest as _;
use subtle::ConstantTimeEq as _;

/// Supported hash algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlg {
    #[cfg(feature = "sha1")]
    Sha1,
    #[cfg(feature = "sha256")]
    Sha256,
    #[cfg(feature = "sha512")]
    Sha512,
}

impl HashAlg {
    /// Look up a [`HashAlg`] by its canonical lower case name, e.g. `"sha256"`.
    ///
    /// The match is case-insensitive, so that names as found in dm-verity
    /// tables (`"sha1"`) and in AVB descriptors (`"SHA256"`) both resolve.
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_lowercase().as_str() {
            #[cfg(feature = "sha1")]
            "sha1" => Ok(Self::Sha1),
            #[cfg(feature = "sha256")]
            "sha256" => Ok(Self::Sha256),
            #[cfg(feature = "sha512")]
            "sha512" => Ok(Self::Sha512),
            _ => Err(CryptoError::UnsupportedAlgorithm),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "sha1")]
            Self::Sha1 => "sha1",
            #[cfg(feature = "sha256")]
            Self::Sha256 => "sha256",
            #[cfg(feature = "sha512")]
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the algorithm's digest in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            #[cfg(feature = "sha1")]
            Self::Sha1 => <sha1::Sha1 as digest::OutputSizeUser>::output_size(),
            #[cfg(feature = "sha256")]
            Self::Sha256 => <sha2::Sha256 as digest::OutputSizeUser>::output_size(),
            #[cfg(feature = "sha512")]
            Self::Sha512 => <sha2::Sha512 as digest::OutputSizeUser>::output_size(),
        }
    }
}

enum HashInstanceState {
    #[cfg(feature = "sha1")]
    Sha1(sha1::Sha1),
    #[cfg(feature = "sha256")]
    Sha256(sha2::Sha256),
    #[cfg(feature = "sha512")]
    Sha512(sha2::Sha512),
}

/// An incremental hash computation.
///
/// Feed the message in arbitrarily sized chunks via [`update()`](Self::update)
/// and obtain the digest via [`finalize()`](Self::finalize) or
/// [`finalize_into()`](Self::finalize_into). A `HashInstance` is consumed by
/// finalization and cannot get reused.
pub struct HashInstance {
    state: HashInstanceState,
}

impl HashInstance {
    pub fn new(alg: HashAlg) -> Self {
        let state = match alg {
            #[cfg(feature = "sha1")]
            HashAlg::Sha1 => HashInstanceState::Sha1(sha1::Sha1::new()),
            #[cfg(feature = "sha256")]
            HashAlg::Sha256 => HashInstanceState::Sha256(sha2::Sha256::new()),
            #[cfg(feature = "sha512")]
            HashAlg::Sha512 => HashInstanceState::Sha512(sha2::Sha512::new()),
        };
        Self { state }
    }

    pub fn alg(&self) -> HashAlg {
        match &self.state {
            #[cfg(feature = "sha1")]
            HashInstanceState::Sha1(_) => HashAlg::Sha1,
            #[cfg(feature = "sha256")]
            HashInstanceState::Sha256(_) => HashAlg::Sha256,
            #[cfg(feature = "sha512")]
            HashInstanceState::Sha512(_) => HashAlg::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            #[cfg(feature = "sha1")]
            HashInstanceState::Sha1(h) => h.update(data),
            #[cfg(feature = "sha256")]
            HashInstanceState::Sha256(h) => h.update(data),
            #[cfg(feature = "sha512")]
            HashInstanceState::Sha512(h) => h.update(data),
        }
    }

    /// Finalize the hash computation and write the digest to `digest`.
    ///
    /// `digest` must be exactly [`digest_len()`](HashAlg::digest_len) bytes
    /// long.
    pub fn finalize_into(self, digest: &mut [u8]) -> Result<(), CryptoError> {
        if digest.len() != self.alg().digest_len() {
            return Err(CryptoError::InvalidDigestLength);
        }
        match self.state {
            #[cfg(feature = "sha1")]
            HashInstanceState::Sha1(h) => digest.copy_from_slice(&h.finalize()),
            #[cfg(feature = "sha256")]
            HashInstanceState::Sha256(h) => digest.copy_from_slice(&h.finalize()),
            #[cfg(feature = "sha512")]
            HashInstanceState::Sha512(h) => digest.copy_from_slice(&h.finalize()),
        }
        Ok(())
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.state {
            #[cfg(feature = "sha1")]
            HashInstanceState::Sha1(h) => h.finalize().to_vec(),
            #[cfg(feature = "sha256")]
            HashInstanceState::Sha256(h) => h.finalize().to_vec(),
            #[cfg(feature = "sha512")]
            HashInstanceState::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Compare two digests in constant time.
///
/// Digests of different lengths never compare equal.
pub fn digests_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
