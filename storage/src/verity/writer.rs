// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`DmVerityWriter`].

use super::{FecLayout, HashTreeBuilder, ReedSolomon, VerityError, VerityLayout, VerityWriter};
use crate::blkdev::{PartitionIo, PartitionIoFuture, PartitionReadRequest, PartitionWriteRequest};
use otaverify_crypto::hash::HashAlg;
use std::{pin, task};

struct DmVerityWriterPartition {
    layout: VerityLayout,
    tree_builder: Option<HashTreeBuilder>,
    /// End of the hash tree data region.
    tree_data_end: u64,
    fec: Option<FecLayout>,
    /// Offset expected for the next [`update()`](VerityWriter::update).
    next_offset: u64,
}

/// [`VerityWriter`] producing dm-verity hash trees and libfec compatible FEC
/// data.
#[derive(Default)]
pub struct DmVerityWriter {
    partition: Option<DmVerityWriterPartition>,
    last_root_digest: Option<Vec<u8>>,
}

fn region_end(offset: u64, size: u64) -> Result<u64, VerityError> {
    offset.checked_add(size).ok_or(VerityError::LayoutOutOfRange { offset, size })
}

impl DmVerityWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root digest of the hash tree built by the most recent
    /// [`finalize()`](VerityWriter::finalize), if any.
    pub fn last_root_digest(&self) -> Option<&[u8]> {
        self.last_root_digest.as_deref()
    }
}

impl VerityWriter for DmVerityWriter {
    type FinalizeFuture<D: PartitionIo> = DmVerityFinalizeFuture<D>;

    fn init(&mut self, layout: &VerityLayout) -> Result<(), VerityError> {
        self.partition = None;
        if !layout.block_size.is_power_of_two() {
            return Err(VerityError::InvalidBlockSize(layout.block_size));
        }
        let tree_data_end = region_end(layout.hash_tree_data_offset, layout.hash_tree_data_size)?;
        region_end(layout.hash_tree_offset, layout.hash_tree_size)?;
        region_end(layout.fec_data_offset, layout.fec_data_size)?;
        region_end(layout.fec_offset, layout.fec_size)?;

        let tree_builder = if layout.hash_tree_size != 0 {
            let alg = HashAlg::from_name(&layout.hash_tree_algorithm)
                .map_err(|_| VerityError::UnsupportedHashAlgorithm(layout.hash_tree_algorithm.clone()))?;
            let calculated = HashTreeBuilder::calculate_size(alg, layout.block_size, layout.hash_tree_data_size);
            if calculated != layout.hash_tree_size {
                return Err(VerityError::HashTreeSizeMismatch {
                    expected: layout.hash_tree_size,
                    calculated,
                });
            }
            Some(HashTreeBuilder::new(
                alg,
                layout.block_size,
                &layout.hash_tree_salt,
                layout.hash_tree_data_size,
            )?)
        } else {
            None
        };

        let fec = if layout.fec_size != 0 {
            Some(FecLayout::new(layout)?)
        } else {
            None
        };

        self.partition = Some(DmVerityWriterPartition {
            layout: layout.clone(),
            tree_builder,
            tree_data_end,
            fec,
            next_offset: 0,
        });
        Ok(())
    }

    fn update(&mut self, offset: u64, data: &[u8]) -> Result<(), VerityError> {
        let partition = self.partition.as_mut().ok_or(VerityError::NotInitialized)?;
        if offset != partition.next_offset {
            return Err(VerityError::NonSequentialUpdate {
                offset,
                expected: partition.next_offset,
            });
        }
        let end = offset.checked_add(data.len() as u64).ok_or(VerityError::DataOverflow)?;
        partition.next_offset = end;

        if let Some(tree_builder) = partition.tree_builder.as_mut() {
            let start = offset.max(partition.layout.hash_tree_data_offset);
            let end = end.min(partition.tree_data_end);
            if start < end {
                tree_builder.update(&data[(start - offset) as usize..(end - offset) as usize])?;
            }
        }
        Ok(())
    }

    fn finalize<D: PartitionIo>(&mut self) -> Result<Self::FinalizeFuture<D>, VerityError> {
        let partition = self.partition.take().ok_or(VerityError::NotInitialized)?;

        let hash_tree = match partition.tree_builder {
            Some(tree_builder) => {
                let tree = tree_builder.build()?;
                tracing::debug!(
                    offset = partition.layout.hash_tree_offset,
                    size = tree.tree.len(),
                    "hash tree built"
                );
                self.last_root_digest = Some(tree.root_digest);
                Some((partition.layout.hash_tree_offset, tree.tree))
            }
            None => None,
        };

        let fec = match partition.fec {
            Some(fec) => Some(FecEncoder::new(fec)?),
            None => None,
        };

        Ok(DmVerityFinalizeFuture {
            hash_tree,
            fec,
            state: DmVerityFinalizeFutureState::Init,
        })
    }
}

/// Progress of the FEC computation.
struct FecEncoder {
    layout: FecLayout,
    rs: ReedSolomon,
    round: u64,
    /// Index of the round's block currently being read.
    block: u64,
    /// Bytes of the current block read so far.
    filled: usize,
    /// The current round's blocks, zero padded.
    blocks: Vec<u8>,
    read_buf: Option<Vec<u8>>,
}

impl FecEncoder {
    fn new(layout: FecLayout) -> Result<Self, VerityError> {
        let rs = ReedSolomon::new(layout.roots)?;
        let blocks_len = usize::try_from(layout.message_len * layout.block_size)
            .map_err(|_| VerityError::MemoryAllocationFailure)?;
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(blocks_len)
            .map_err(|_| VerityError::MemoryAllocationFailure)?;
        blocks.resize(blocks_len, 0u8);
        Ok(Self {
            layout,
            rs,
            round: 0,
            block: 0,
            filled: 0,
            blocks,
            read_buf: Some(Vec::new()),
        })
    }

    /// Region to read next for the current round, if any.
    ///
    /// Blocks beyond the end of the FEC data region are left zero.
    fn next_read(&mut self) -> Option<(u64, usize)> {
        let block_size = self.layout.block_size;
        while self.block < self.layout.message_len {
            let rel_offset = self.layout.interleaved_block_offset(self.round, self.block);
            if rel_offset < self.layout.data_size {
                let block_len = (self.layout.data_size - rel_offset).min(block_size) as usize;
                if self.filled < block_len {
                    return Some((
                        self.layout.data_offset + rel_offset + self.filled as u64,
                        block_len - self.filled,
                    ));
                }
            }
            self.block += 1;
            self.filled = 0;
        }
        None
    }

    fn complete_read(&mut self, data: &[u8]) {
        let start = self.block as usize * self.layout.block_size as usize + self.filled;
        self.blocks[start..start + data.len()].copy_from_slice(data);
        self.filled += data.len();
    }

    /// Encode the current round, once all of its blocks have been read.
    fn encode_round(&self) -> Result<PartitionWriteRequest, VerityError> {
        let block_size = self.layout.block_size as usize;
        let roots = self.rs.roots();
        let mut output = Vec::new();
        output
            .try_reserve_exact(block_size * roots)
            .map_err(|_| VerityError::MemoryAllocationFailure)?;
        output.resize(block_size * roots, 0u8);

        let mut message = vec![0u8; self.rs.message_len()];
        for (k, parity) in output.chunks_exact_mut(roots).enumerate() {
            for (j, m) in message.iter_mut().enumerate() {
                *m = self.blocks[j * block_size + k];
            }
            self.rs.encode(&message, parity);
        }
        Ok(PartitionWriteRequest::new(
            self.layout.round_output_offset(self.round),
            output,
        ))
    }

    /// Move on to the next round. Returns `false` if all rounds are done.
    fn advance_round(&mut self) -> bool {
        self.round += 1;
        self.block = 0;
        self.filled = 0;
        self.blocks.fill(0);
        self.round < self.layout.rounds
    }
}

enum DmVerityFinalizeFutureState<D: PartitionIo> {
    Init,
    WriteHashTree { write_fut: D::WriteFuture },
    PrepareFecRead,
    ReadFecBlock { read_fut: D::ReadFuture },
    WriteFecRound { write_fut: D::WriteFuture },
    PrepareWriteSync,
    WriteSync { sync_fut: D::WriteSyncFuture },
    Done,
}

/// [`VerityWriter::FinalizeFuture`] of [`DmVerityWriter`].
///
/// Writes the hash tree, then computes the FEC round by round from the data
/// read back from the device, including the freshly written hash tree, and
/// finally syncs the device.
pub struct DmVerityFinalizeFuture<D: PartitionIo> {
    hash_tree: Option<(u64, Vec<u8>)>,
    fec: Option<FecEncoder>,
    state: DmVerityFinalizeFutureState<D>,
}

impl<D: PartitionIo> DmVerityFinalizeFuture<D> {
    fn poll_steps(&mut self, dev: &D, cx: &mut task::Context<'_>) -> task::Poll<Result<(), VerityError>> {
        loop {
            match &mut self.state {
                DmVerityFinalizeFutureState::Init => match self.hash_tree.take() {
                    Some((offset, tree)) if !tree.is_empty() => {
                        let write_fut = match dev.write(PartitionWriteRequest::new(offset, tree)) {
                            Ok(Ok(write_fut)) => write_fut,
                            Ok(Err((_, e))) | Err(e) => return task::Poll::Ready(Err(e.into())),
                        };
                        self.state = DmVerityFinalizeFutureState::WriteHashTree { write_fut };
                    }
                    _ => {
                        self.state = DmVerityFinalizeFutureState::PrepareFecRead;
                    }
                },
                DmVerityFinalizeFutureState::WriteHashTree { write_fut } => {
                    match PartitionIoFuture::poll(pin::Pin::new(write_fut), dev, cx) {
                        task::Poll::Ready(Ok((_, Ok(())))) => (),
                        task::Poll::Ready(Ok((_, Err(e))) | Err(e)) => return task::Poll::Ready(Err(e.into())),
                        task::Poll::Pending => return task::Poll::Pending,
                    }
                    self.state = DmVerityFinalizeFutureState::PrepareFecRead;
                }
                DmVerityFinalizeFutureState::PrepareFecRead => {
                    let fec = match self.fec.as_mut() {
                        Some(fec) => fec,
                        None => {
                            self.state = DmVerityFinalizeFutureState::PrepareWriteSync;
                            continue;
                        }
                    };
                    match fec.next_read() {
                        Some((offset, len)) => {
                            let buf = fec.read_buf.take().unwrap_or_default();
                            let request = PartitionReadRequest::new(offset, buf, len)?;
                            let read_fut = match dev.read(request) {
                                Ok(Ok(read_fut)) => read_fut,
                                Ok(Err((_, e))) | Err(e) => return task::Poll::Ready(Err(e.into())),
                            };
                            self.state = DmVerityFinalizeFutureState::ReadFecBlock { read_fut };
                        }
                        None => {
                            let request = fec.encode_round()?;
                            let write_fut = match dev.write(request) {
                                Ok(Ok(write_fut)) => write_fut,
                                Ok(Err((_, e))) | Err(e) => return task::Poll::Ready(Err(e.into())),
                            };
                            self.state = DmVerityFinalizeFutureState::WriteFecRound { write_fut };
                        }
                    }
                }
                DmVerityFinalizeFutureState::ReadFecBlock { read_fut } => {
                    let (request, result) = match PartitionIoFuture::poll(pin::Pin::new(read_fut), dev, cx) {
                        task::Poll::Ready(Ok(completion)) => completion,
                        task::Poll::Ready(Err(e)) => return task::Poll::Ready(Err(e.into())),
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let n = match result {
                        Ok(0) => return task::Poll::Ready(Err(VerityError::UnexpectedEof(request.offset()))),
                        Ok(n) => n,
                        Err(e) => return task::Poll::Ready(Err(e.into())),
                    };
                    let fec = match self.fec.as_mut() {
                        Some(fec) => fec,
                        None => return task::Poll::Ready(Err(crate::partition_io_err_internal!().into())),
                    };
                    fec.complete_read(&request.data()[..n]);
                    fec.read_buf = Some(request.into_buffer());
                    self.state = DmVerityFinalizeFutureState::PrepareFecRead;
                }
                DmVerityFinalizeFutureState::WriteFecRound { write_fut } => {
                    match PartitionIoFuture::poll(pin::Pin::new(write_fut), dev, cx) {
                        task::Poll::Ready(Ok((_, Ok(())))) => (),
                        task::Poll::Ready(Ok((_, Err(e))) | Err(e)) => return task::Poll::Ready(Err(e.into())),
                        task::Poll::Pending => return task::Poll::Pending,
                    }
                    let more_rounds = match self.fec.as_mut() {
                        Some(fec) => fec.advance_round(),
                        None => false,
                    };
                    self.state = if more_rounds {
                        DmVerityFinalizeFutureState::PrepareFecRead
                    } else {
                        tracing::debug!("FEC written");
                        self.fec = None;
                        DmVerityFinalizeFutureState::PrepareWriteSync
                    };
                }
                DmVerityFinalizeFutureState::PrepareWriteSync => {
                    let sync_fut = dev.write_sync()?;
                    self.state = DmVerityFinalizeFutureState::WriteSync { sync_fut };
                }
                DmVerityFinalizeFutureState::WriteSync { sync_fut } => {
                    match PartitionIoFuture::poll(pin::Pin::new(sync_fut), dev, cx) {
                        task::Poll::Ready(Ok(())) => return task::Poll::Ready(Ok(())),
                        task::Poll::Ready(Err(e)) => return task::Poll::Ready(Err(e.into())),
                        task::Poll::Pending => return task::Poll::Pending,
                    }
                }
                DmVerityFinalizeFutureState::Done => unreachable!("Attempt to poll completed future."),
            }
        }
    }
}

impl<D: PartitionIo> PartitionIoFuture<D> for DmVerityFinalizeFuture<D> {
    type Output = Result<(), VerityError>;

    fn poll(self: pin::Pin<&mut Self>, dev: &D, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        let result = this.poll_steps(dev, cx);
        if result.is_ready() {
            this.state = DmVerityFinalizeFutureState::Done;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkdev::{PartitionIoError, PartitionIoFutureAsCoreFuture, test::TestPartitionDevice};
    use otaverify_utils_async::test::TestAsyncExecutor;
    use std::sync::Arc;

    const BS: u64 = 4096;

    fn test_layout() -> VerityLayout {
        VerityLayout {
            block_size: BS as u32,
            hash_tree_algorithm: "sha1".to_owned(),
            hash_tree_salt: vec![0xaa, 0xbb, 0xcc, 0xdd],
            hash_tree_data_offset: 0,
            hash_tree_data_size: 200 * BS,
            hash_tree_offset: 200 * BS,
            hash_tree_size: 3 * BS,
            fec_data_offset: 0,
            fec_data_size: 203 * BS,
            fec_offset: 203 * BS,
            fec_size: 2 * BS,
            fec_roots: 2,
        }
    }

    fn test_image() -> Vec<u8> {
        let mut image = vec![0u8; 256 * BS as usize];
        for (i, b) in image[..200 * BS as usize].iter_mut().enumerate() {
            *b = ((i / BS as usize) as u8).wrapping_mul(7) ^ (i % 251) as u8;
        }
        image
    }

    fn run_finalize(writer: &mut DmVerityWriter, dev: &Arc<TestPartitionDevice>) -> Result<(), VerityError> {
        let fut = writer.finalize::<TestPartitionDevice>()?;
        let executor = TestAsyncExecutor::new();
        let waiter = TestAsyncExecutor::spawn(&executor, PartitionIoFutureAsCoreFuture::new(dev.clone(), fut));
        TestAsyncExecutor::run_to_completion(&executor);
        waiter.take().unwrap()
    }

    #[test]
    fn test_write_hash_tree_and_fec() {
        let layout = test_layout();
        let image = test_image();
        let fs_data = image[..200 * BS as usize].to_vec();

        let mut writer = DmVerityWriter::new();
        writer.init(&layout).unwrap();
        let mut offset = 0;
        for chunk in fs_data.chunks(128 * 1024) {
            writer.update(offset, chunk).unwrap();
            offset += chunk.len() as u64;
        }

        let dev = Arc::new(TestPartitionDevice::new(image, true));
        run_finalize(&mut writer, &dev).unwrap();
        let result = dev.data();

        // The filesystem data is left alone.
        assert_eq!(&result[..fs_data.len()], &fs_data[..]);

        // The hash tree matches an independently built one.
        let mut builder = HashTreeBuilder::new(HashAlg::Sha1, BS as u32, &layout.hash_tree_salt, 200 * BS).unwrap();
        builder.update(&fs_data).unwrap();
        let expected_tree = builder.build().unwrap();
        assert_eq!(
            &result[layout.hash_tree_offset as usize..(layout.hash_tree_offset + layout.hash_tree_size) as usize],
            &expected_tree.tree[..]
        );
        assert_eq!(writer.last_root_digest(), Some(&expected_tree.root_digest[..]));

        // Every codeword formed from the single round's interleaved blocks
        // and its parity bytes is valid.
        let rs = ReedSolomon::new(2).unwrap();
        let fec = &result[layout.fec_offset as usize..(layout.fec_offset + layout.fec_size) as usize];
        assert!(fec.iter().any(|b| *b != 0));
        for k in 0..BS as usize {
            let mut codeword: Vec<u8> = (0..rs.message_len())
                .map(|j| {
                    let pos = j * BS as usize + k;
                    if pos < layout.fec_data_size as usize { result[pos] } else { 0 }
                })
                .collect();
            codeword.extend_from_slice(&fec[k * 2..k * 2 + 2]);
            assert!(rs.syndromes(&codeword).iter().all(|s| *s == 0));
        }

        // Nothing past the FEC got written.
        assert!(
            result[(layout.fec_offset + layout.fec_size) as usize..]
                .iter()
                .all(|b| *b == 0)
        );
    }

    #[test]
    fn test_fec_with_short_reads() {
        let layout = test_layout();
        let image = test_image();

        let mut writer = DmVerityWriter::new();
        writer.init(&layout).unwrap();
        writer.update(0, &image[..200 * BS as usize]).unwrap();
        let dev = Arc::new(TestPartitionDevice::new(image.clone(), true));
        run_finalize(&mut writer, &dev).unwrap();
        let expected = dev.data();

        let mut writer = DmVerityWriter::new();
        writer.init(&layout).unwrap();
        writer.update(0, &image[..200 * BS as usize]).unwrap();
        let mut dev = TestPartitionDevice::new(image, true);
        dev.set_faults(crate::blkdev::test::TestPartitionFaults {
            max_read_len: Some(1000),
            fail_read_at: None,
        });
        let dev = Arc::new(dev);
        run_finalize(&mut writer, &dev).unwrap();
        assert_eq!(dev.data(), expected);
    }

    #[test]
    fn test_hash_tree_only() {
        let layout = VerityLayout {
            fec_data_size: 0,
            fec_offset: 0,
            fec_size: 0,
            ..test_layout()
        };
        let image = test_image();
        let mut writer = DmVerityWriter::new();
        writer.init(&layout).unwrap();
        writer.update(0, &image[..200 * BS as usize]).unwrap();
        let dev = Arc::new(TestPartitionDevice::new(image, true));
        run_finalize(&mut writer, &dev).unwrap();
        let result = dev.data();
        assert!(result[203 * BS as usize..].iter().all(|b| *b == 0));
        assert!(result[200 * BS as usize..203 * BS as usize].iter().any(|b| *b != 0));
    }

    #[test]
    fn test_update_errors() {
        let mut writer = DmVerityWriter::new();
        assert!(matches!(writer.update(0, &[0u8; 16]), Err(VerityError::NotInitialized)));
        assert!(matches!(
            writer.finalize::<TestPartitionDevice>(),
            Err(VerityError::NotInitialized)
        ));

        writer.init(&test_layout()).unwrap();
        writer.update(0, &[0u8; 4096]).unwrap();
        assert!(matches!(
            writer.update(0, &[0u8; 4096]),
            Err(VerityError::NonSequentialUpdate {
                offset: 0,
                expected: 4096
            })
        ));
        // Missing data.
        assert!(matches!(
            writer.finalize::<TestPartitionDevice>(),
            Err(VerityError::IncompleteData { .. })
        ));
    }

    #[test]
    fn test_init_layout_errors() {
        let mut writer = DmVerityWriter::new();
        assert!(matches!(
            writer.init(&VerityLayout {
                hash_tree_size: 4 * BS,
                ..test_layout()
            }),
            Err(VerityError::HashTreeSizeMismatch {
                calculated: 12288,
                ..
            })
        ));
        assert!(matches!(
            writer.init(&VerityLayout {
                fec_size: 3 * BS,
                ..test_layout()
            }),
            Err(VerityError::FecSizeMismatch { .. })
        ));
        assert!(matches!(
            writer.init(&VerityLayout {
                hash_tree_algorithm: "md5".to_owned(),
                ..test_layout()
            }),
            Err(VerityError::UnsupportedHashAlgorithm(_))
        ));
    }

    #[test]
    fn test_init_region_overflow() {
        let mut writer = DmVerityWriter::new();
        let offset = u64::MAX - 10;
        assert!(matches!(
            writer.init(&VerityLayout {
                hash_tree_data_offset: offset,
                ..test_layout()
            }),
            Err(VerityError::LayoutOutOfRange { offset: o, size }) if o == offset && size == 200 * BS
        ));
        assert!(matches!(
            writer.init(&VerityLayout {
                fec_offset: offset,
                ..test_layout()
            }),
            Err(VerityError::LayoutOutOfRange { .. })
        ));
        assert!(matches!(writer.update(0, &[0u8; 16]), Err(VerityError::NotInitialized)));
    }

    #[test]
    fn test_read_only_device() {
        let image = test_image();
        let mut writer = DmVerityWriter::new();
        writer.init(&test_layout()).unwrap();
        writer.update(0, &image[..200 * BS as usize]).unwrap();
        let dev = Arc::new(TestPartitionDevice::new(image, false));
        assert!(matches!(
            run_finalize(&mut writer, &dev),
            Err(VerityError::Io(PartitionIoError::ReadOnly))
        ));
    }
}
