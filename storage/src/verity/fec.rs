// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Reed-Solomon forward error correction in the libfec format.

use super::{VerityError, VerityLayout};

/// Number of symbols in a codeword.
const NN: usize = 255;
/// Log of zero in index form.
const A0: usize = NN;
/// Field generator polynomial for GF(2^8).
const GF_POLY: usize = 0x11d;
/// First consecutive root of the code generator polynomial, in index form.
const FCR: usize = 0;
/// Primitive element, in index form.
const PRIM: usize = 1;

const MIN_ROOTS: u32 = 2;
const MAX_ROOTS: u32 = 24;

/// Systematic Reed-Solomon encoder over GF(2^8).
///
/// Codewords are 255 bytes long and consist of the `255 - roots` message
/// bytes followed by `roots` parity bytes.
pub struct ReedSolomon {
    roots: usize,
    alpha_to: [u8; NN + 1],
    index_of: [usize; NN + 1],
    /// Generator polynomial coefficients, in index form.
    genpoly: Vec<usize>,
}

impl ReedSolomon {
    pub fn new(roots: u32) -> Result<Self, VerityError> {
        if !(MIN_ROOTS..=MAX_ROOTS).contains(&roots) {
            return Err(VerityError::InvalidFecRoots(roots));
        }
        let roots = roots as usize;

        let mut alpha_to = [0u8; NN + 1];
        let mut index_of = [0usize; NN + 1];
        index_of[0] = A0;
        alpha_to[A0] = 0;
        let mut sr = 1usize;
        for i in 0..NN {
            index_of[sr] = i;
            alpha_to[i] = sr as u8;
            sr <<= 1;
            if sr & (1 << 8) != 0 {
                sr ^= GF_POLY;
            }
            sr &= NN;
        }

        // Form the generator polynomial from the product of (x - alpha^root).
        let mut genpoly = vec![0u8; roots + 1];
        genpoly[0] = 1;
        let mut root = FCR * PRIM;
        for i in 0..roots {
            genpoly[i + 1] = 1;
            for j in (1..=i).rev() {
                genpoly[j] = if genpoly[j] != 0 {
                    genpoly[j - 1] ^ alpha_to[(index_of[genpoly[j] as usize] + root) % NN]
                } else {
                    genpoly[j - 1]
                };
            }
            // genpoly[0] can never be zero.
            genpoly[0] = alpha_to[(index_of[genpoly[0] as usize] + root) % NN];
            root += PRIM;
        }
        let genpoly = genpoly.iter().map(|c| index_of[*c as usize]).collect();

        Ok(Self {
            roots,
            alpha_to,
            index_of,
            genpoly,
        })
    }

    pub fn roots(&self) -> usize {
        self.roots
    }

    /// Number of message bytes per codeword.
    pub fn message_len(&self) -> usize {
        NN - self.roots
    }

    /// Compute the parity bytes of `message`.
    ///
    /// `message` must be [`message_len()`](Self::message_len) bytes long and
    /// `parity` [`roots()`](Self::roots) bytes.
    pub fn encode(&self, message: &[u8], parity: &mut [u8]) {
        debug_assert_eq!(message.len(), self.message_len());
        debug_assert_eq!(parity.len(), self.roots);
        let roots = self.roots;
        parity.fill(0);
        for m in message {
            let feedback = self.index_of[(*m ^ parity[0]) as usize];
            if feedback != A0 {
                for j in 1..roots {
                    parity[j] ^= self.alpha_to[(feedback + self.genpoly[roots - j]) % NN];
                }
            }
            parity.copy_within(1.., 0);
            parity[roots - 1] = if feedback != A0 {
                self.alpha_to[(feedback + self.genpoly[0]) % NN]
            } else {
                0
            };
        }
    }

    #[cfg(test)]
    fn gf_mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            0
        } else {
            self.alpha_to[(self.index_of[a as usize] + self.index_of[b as usize]) % NN]
        }
    }

    /// Evaluate the codeword polynomial at each of the generator's roots.
    #[cfg(test)]
    pub(crate) fn syndromes(&self, codeword: &[u8]) -> Vec<u8> {
        (0..self.roots)
            .map(|i| {
                let x = self.alpha_to[((FCR + i) * PRIM) % NN];
                codeword.iter().fold(0u8, |s, c| self.gf_mul(s, x) ^ c)
            })
            .collect()
    }
}

/// Geometry of a partition's FEC region.
///
/// The FEC data is split into `rounds` groups of `message_len` blocks each.
/// The blocks are interleaved: the `j`th block of round `i` is the FEC data
/// block at index `i + j * rounds`. Codeword `k` of a round is formed by
/// the `k`th bytes of all its blocks, and its parity bytes are stored at
/// offset `k * roots` within the round's FEC output.
#[derive(Clone, Debug)]
pub struct FecLayout {
    pub block_size: u64,
    pub roots: u32,
    pub message_len: u64,
    pub rounds: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub fec_offset: u64,
}

impl FecLayout {
    pub fn new(layout: &VerityLayout) -> Result<Self, VerityError> {
        if layout.fec_roots < MIN_ROOTS || layout.fec_roots > MAX_ROOTS {
            return Err(VerityError::InvalidFecRoots(layout.fec_roots));
        }
        let block_size = layout.block_size as u64;
        if block_size == 0 {
            return Err(VerityError::InvalidBlockSize(layout.block_size));
        }
        let message_len = (NN as u64) - layout.fec_roots as u64;
        let rounds = (layout.fec_data_size / block_size).div_ceil(message_len);
        let calculated = rounds * layout.fec_roots as u64 * block_size;
        if calculated != layout.fec_size {
            return Err(VerityError::FecSizeMismatch {
                expected: layout.fec_size,
                calculated,
            });
        }

        Ok(Self {
            block_size,
            roots: layout.fec_roots,
            message_len,
            rounds,
            data_offset: layout.fec_data_offset,
            data_size: layout.fec_data_size,
            fec_offset: layout.fec_offset,
        })
    }

    /// Offset of the `j`th block of round `round`, relative to the FEC data
    /// region.
    pub fn interleaved_block_offset(&self, round: u64, j: u64) -> u64 {
        round * self.block_size + j * self.rounds * self.block_size
    }

    /// Size of a round's FEC output.
    pub fn round_output_len(&self) -> u64 {
        self.roots as u64 * self.block_size
    }

    /// Absolute offset of a round's FEC output.
    pub fn round_output_offset(&self, round: u64) -> u64 {
        self.fec_offset + round * self.round_output_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                (x >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_codewords_have_zero_syndromes() {
        for roots in [2u32, 8, 16, 24] {
            let rs = ReedSolomon::new(roots).unwrap();
            for seed in 0..4 {
                let mut codeword = pseudo_random(rs.message_len(), seed);
                let mut parity = vec![0u8; rs.roots()];
                rs.encode(&codeword, &mut parity);
                codeword.extend_from_slice(&parity);
                assert_eq!(codeword.len(), NN);
                assert!(rs.syndromes(&codeword).iter().all(|s| *s == 0));

                // A single byte error is detected.
                codeword[seed as usize * 7] ^= 0x40;
                assert!(rs.syndromes(&codeword).iter().any(|s| *s != 0));
            }
        }
    }

    #[test]
    fn test_all_zero_message() {
        let rs = ReedSolomon::new(2).unwrap();
        let mut parity = [0xffu8; 2];
        rs.encode(&[0u8; NN - 2], &mut parity);
        assert_eq!(parity, [0, 0]);
    }

    #[test]
    fn test_invalid_roots() {
        assert!(matches!(ReedSolomon::new(1), Err(VerityError::InvalidFecRoots(1))));
        assert!(matches!(ReedSolomon::new(25), Err(VerityError::InvalidFecRoots(25))));
    }

    #[test]
    fn test_fec_layout() {
        let layout = VerityLayout {
            block_size: 4096,
            fec_data_offset: 0,
            fec_data_size: 203 * 4096,
            fec_offset: 203 * 4096,
            fec_size: 2 * 4096,
            fec_roots: 2,
            ..Default::default()
        };
        let fec = FecLayout::new(&layout).unwrap();
        assert_eq!(fec.message_len, 253);
        assert_eq!(fec.rounds, 1);
        assert_eq!(fec.interleaved_block_offset(0, 5), 5 * 4096);

        let layout = VerityLayout {
            fec_data_size: 600 * 4096,
            fec_size: 3 * 2 * 4096,
            ..layout
        };
        let fec = FecLayout::new(&layout).unwrap();
        assert_eq!(fec.rounds, 3);
        assert_eq!(fec.interleaved_block_offset(1, 2), (1 + 2 * 3) * 4096);
        assert_eq!(fec.round_output_offset(2), 203 * 4096 + 2 * 2 * 4096);

        let layout = VerityLayout { fec_size: 4096, ..layout };
        assert!(matches!(
            FecLayout::new(&layout),
            Err(VerityError::FecSizeMismatch {
                expected: 4096,
                calculated: 24576
            })
        ));
    }
}
