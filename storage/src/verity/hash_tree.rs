// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`HashTreeBuilder`].

use super::VerityError;
use otaverify_crypto::hash::{HashAlg, HashInstance};

/// A built dm-verity hash tree.
pub struct HashTree {
    /// Digest of the topmost tree level.
    pub root_digest: Vec<u8>,
    /// The tree levels, top level first, each padded to the block size.
    pub tree: Vec<u8>,
}

/// Incremental dm-verity hash tree builder.
///
/// The data's blocks get hashed as they are fed through
/// [`update()`](Self::update), the upper tree levels get computed at
/// [`build()`](Self::build).
///
/// Every hash is computed over the salt followed by the block and padded
/// with zeros to the next power of two. Tree levels get padded with zeros to
/// a full block.
pub struct HashTreeBuilder {
    alg: HashAlg,
    block_size: usize,
    salt: Vec<u8>,
    data_size: u64,
    /// Bytes hashed so far, including those buffered in `partial_block`.
    hashed: u64,
    partial_block: Vec<u8>,
    /// Padded hashes of the data blocks.
    leaf_hashes: Vec<u8>,
}

impl HashTreeBuilder {
    pub fn new(alg: HashAlg, block_size: u32, salt: &[u8], data_size: u64) -> Result<Self, VerityError> {
        let padded_digest_len = Self::padded_digest_len(alg);
        if !block_size.is_power_of_two() || (block_size as usize) < 2 * padded_digest_len {
            return Err(VerityError::InvalidBlockSize(block_size));
        }
        if data_size % block_size as u64 != 0 {
            return Err(VerityError::UnalignedDataSize { data_size, block_size });
        }

        let leaf_hashes_len = usize::try_from(data_size / block_size as u64)
            .ok()
            .and_then(|blocks| blocks.checked_mul(padded_digest_len))
            .ok_or(VerityError::MemoryAllocationFailure)?;
        let mut leaf_hashes = Vec::new();
        leaf_hashes
            .try_reserve_exact(leaf_hashes_len)
            .map_err(|_| VerityError::MemoryAllocationFailure)?;

        Ok(Self {
            alg,
            block_size: block_size as usize,
            salt: salt.to_vec(),
            data_size,
            hashed: 0,
            partial_block: Vec::with_capacity(block_size as usize),
            leaf_hashes,
        })
    }

    fn padded_digest_len(alg: HashAlg) -> usize {
        alg.digest_len().next_power_of_two()
    }

    /// Size of the hash tree for `data_size` bytes of data.
    pub fn calculate_size(alg: HashAlg, block_size: u32, data_size: u64) -> u64 {
        let block_size = block_size as u64;
        let hashes_per_block = block_size / Self::padded_digest_len(alg) as u64;
        let mut level_blocks = data_size.div_ceil(block_size);
        let mut total_blocks = 0;
        loop {
            level_blocks = level_blocks.div_ceil(hashes_per_block);
            total_blocks += level_blocks;
            if level_blocks <= 1 {
                break;
            }
        }
        total_blocks * block_size
    }

    pub fn hashed(&self) -> u64 {
        self.hashed
    }

    pub fn update(&mut self, mut data: &[u8]) -> Result<(), VerityError> {
        if data.len() as u64 > self.data_size - self.hashed {
            return Err(VerityError::DataOverflow);
        }
        self.hashed += data.len() as u64;

        if !self.partial_block.is_empty() {
            let n = data.len().min(self.block_size - self.partial_block.len());
            self.partial_block.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.partial_block.len() < self.block_size {
                return Ok(());
            }
            let block = std::mem::take(&mut self.partial_block);
            self.hash_leaf(&block);
            self.partial_block = block;
            self.partial_block.clear();
        }

        let mut blocks = data.chunks_exact(self.block_size);
        for block in &mut blocks {
            self.hash_leaf(block);
        }
        self.partial_block.extend_from_slice(blocks.remainder());
        Ok(())
    }

    fn hash_leaf(&mut self, block: &[u8]) {
        let start = self.leaf_hashes.len();
        self.leaf_hashes.resize(start + Self::padded_digest_len(self.alg), 0u8);
        let digest = hash_block(self.alg, &self.salt, block);
        self.leaf_hashes[start..start + digest.len()].copy_from_slice(&digest);
    }

    /// Compute the upper tree levels and the root digest.
    pub fn build(self) -> Result<HashTree, VerityError> {
        if self.hashed != self.data_size || !self.partial_block.is_empty() {
            return Err(VerityError::IncompleteData {
                hashed: self.hashed,
                expected: self.data_size,
            });
        }

        let padded_digest_len = Self::padded_digest_len(self.alg);
        let mut levels: Vec<Vec<u8>> = Vec::new();
        let mut level = self.leaf_hashes;
        while !level.is_empty() {
            level.resize(level.len().next_multiple_of(self.block_size), 0u8);
            if level.len() == self.block_size {
                levels.push(level);
                break;
            }
            let mut next_level = Vec::with_capacity(level.len() / self.block_size * padded_digest_len);
            for block in level.chunks_exact(self.block_size) {
                let start = next_level.len();
                next_level.resize(start + padded_digest_len, 0u8);
                let digest = hash_block(self.alg, &self.salt, block);
                next_level[start..start + digest.len()].copy_from_slice(&digest);
            }
            levels.push(level);
            level = next_level;
        }

        let root_digest = match levels.last() {
            Some(top_level) => hash_block(self.alg, &self.salt, top_level),
            None => hash_block(self.alg, &self.salt, &vec![0u8; self.block_size]),
        };
        let tree = levels.into_iter().rev().flatten().collect();

        Ok(HashTree { root_digest, tree })
    }
}

fn hash_block(alg: HashAlg, salt: &[u8], block: &[u8]) -> Vec<u8> {
    let mut h = HashInstance::new(alg);
    h.update(salt);
    h.update(block);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_size() {
        // 200 blocks, SHA-1 padded to 32 bytes: two leaf level blocks plus
        // one root level block.
        assert_eq!(HashTreeBuilder::calculate_size(HashAlg::Sha1, 4096, 200 * 4096), 3 * 4096);
        assert_eq!(HashTreeBuilder::calculate_size(HashAlg::Sha256, 4096, 128 * 4096), 4096);
        assert_eq!(HashTreeBuilder::calculate_size(HashAlg::Sha256, 4096, 129 * 4096), 3 * 4096);
        assert_eq!(HashTreeBuilder::calculate_size(HashAlg::Sha256, 4096, 4096), 4096);
        assert_eq!(HashTreeBuilder::calculate_size(HashAlg::Sha256, 4096, 0), 0);
    }

    #[test]
    fn test_single_level() {
        let salt = [0x5au8; 8];
        let mut data = vec![0x11u8; 4096];
        data.extend_from_slice(&[0x22u8; 4096]);

        let mut builder = HashTreeBuilder::new(HashAlg::Sha256, 4096, &salt, data.len() as u64).unwrap();
        // Feed unaligned chunks.
        builder.update(&data[..100]).unwrap();
        builder.update(&data[100..5000]).unwrap();
        builder.update(&data[5000..]).unwrap();
        let tree = builder.build().unwrap();

        assert_eq!(tree.tree.len(), 4096);
        assert_eq!(&tree.tree[..32], &hash_block(HashAlg::Sha256, &salt, &data[..4096])[..]);
        assert_eq!(&tree.tree[32..64], &hash_block(HashAlg::Sha256, &salt, &data[4096..])[..]);
        assert!(tree.tree[64..].iter().all(|b| *b == 0));
        assert_eq!(tree.root_digest, hash_block(HashAlg::Sha256, &salt, &tree.tree));
    }

    #[test]
    fn test_two_levels_top_first() {
        let salt = [1u8, 2, 3, 4];
        let data: Vec<u8> = (0..200 * 4096u32).map(|i| (i / 4096) as u8).collect();

        let mut builder = HashTreeBuilder::new(HashAlg::Sha1, 4096, &salt, data.len() as u64).unwrap();
        for chunk in data.chunks(128 * 1024) {
            builder.update(chunk).unwrap();
        }
        let tree = builder.build().unwrap();
        assert_eq!(
            tree.tree.len() as u64,
            HashTreeBuilder::calculate_size(HashAlg::Sha1, 4096, data.len() as u64)
        );

        let (top, leaves) = tree.tree.split_at(4096);
        assert_eq!(&top[..20], &hash_block(HashAlg::Sha1, &salt, &leaves[..4096])[..]);
        assert_eq!(&top[32..52], &hash_block(HashAlg::Sha1, &salt, &leaves[4096..])[..]);
        assert_eq!(&leaves[..20], &hash_block(HashAlg::Sha1, &salt, &data[..4096])[..]);
        assert_eq!(
            &leaves[199 * 32..199 * 32 + 20],
            &hash_block(HashAlg::Sha1, &salt, &data[199 * 4096..])[..]
        );
        assert_eq!(tree.root_digest, hash_block(HashAlg::Sha1, &salt, top));
    }

    #[test]
    fn test_incomplete_and_overflow() {
        let mut builder = HashTreeBuilder::new(HashAlg::Sha256, 4096, &[], 4096).unwrap();
        builder.update(&[0u8; 100]).unwrap();
        assert!(matches!(builder.update(&[0u8; 4096]), Err(VerityError::DataOverflow)));
        assert!(matches!(
            builder.build(),
            Err(VerityError::IncompleteData {
                hashed: 100,
                expected: 4096
            })
        ));

        assert!(matches!(
            HashTreeBuilder::new(HashAlg::Sha256, 4096, &[], 4095),
            Err(VerityError::UnalignedDataSize { .. })
        ));
        assert!(matches!(
            HashTreeBuilder::new(HashAlg::Sha256, 48, &[], 0),
            Err(VerityError::InvalidBlockSize(48))
        ));
    }
}
