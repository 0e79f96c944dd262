// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`HashPartitionFuture`], the chunked read-and-hash
//! driver.

use otaverify_crypto::hash::{HashAlg, HashInstance};
use otaverify_storage::blkdev::{PartitionIo, PartitionIoError, PartitionIoFuture, PartitionReadRequest};
use otaverify_storage::verity::{VerityError, VerityWriter};
use otaverify_utils_async::asynchronous::YieldNow;
use std::{pin, task};

/// Size of the chunks a partition gets read in.
pub const READ_CHUNK_SIZE: usize = 128 * 1024;

/// Algorithm of the partition digests.
pub const PARTITION_HASH_ALG: HashAlg = HashAlg::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum HashPartitionError {
    #[error("read at offset {offset} failed: {source}")]
    Read {
        offset: u64,
        #[source]
        source: PartitionIoError,
    },
    #[error("unexpected end of device at offset {0}")]
    UnexpectedEof(u64),
    #[error(transparent)]
    Verity(#[from] VerityError),
}

enum HashPartitionFutureState<D: PartitionIo, V: VerityWriter> {
    PrepareRead,
    Read { read_fut: D::ReadFuture },
    Yield { yield_now: YieldNow },
    FinalizeVerity { finalize_fut: V::FinalizeFuture<D> },
    Done,
}

/// Read a partition in chunks and compute its digest.
///
/// The filesystem data region `[0, filesystem_data_end)` gets fed to the
/// [`VerityWriter`], if any, in addition to the hasher. Once it has been
/// read completely, the verity metadata gets written and the remainder of
/// the partition, now including the fresh metadata, gets hashed.
///
/// On completion, the verity writer is handed back together with the raw
/// digest.
pub struct HashPartitionFuture<D: PartitionIo, V: VerityWriter> {
    partition_size: u64,
    filesystem_data_end: u64,
    offset: u64,
    hasher: Option<HashInstance>,
    buf: Option<Vec<u8>>,
    verity_writer: Option<V>,
    verity_finalized: bool,
    state: HashPartitionFutureState<D, V>,
}

impl<D: PartitionIo, V: VerityWriter> HashPartitionFuture<D, V> {
    /// Create a new [`HashPartitionFuture`].
    ///
    /// # Arguments:
    ///
    /// * `partition_size` - Number of bytes to hash.
    /// * `filesystem_data_end` - End of the data to feed to the
    ///   `verity_writer`.
    /// * `verity_writer` - An already [initialized](VerityWriter::init)
    ///   writer, if verity metadata is to be written.
    pub fn new(
        partition_size: u64,
        filesystem_data_end: u64,
        verity_writer: Option<V>,
    ) -> Result<Self, (Option<V>, PartitionIoError)> {
        let buf_len = (READ_CHUNK_SIZE as u64).min(partition_size) as usize;
        let mut buf = Vec::new();
        if buf.try_reserve_exact(buf_len).is_err() {
            return Err((verity_writer, PartitionIoError::MemoryAllocationFailure));
        }

        Ok(Self {
            partition_size,
            filesystem_data_end: filesystem_data_end.min(partition_size),
            offset: 0,
            hasher: Some(HashInstance::new(PARTITION_HASH_ALG)),
            buf: Some(buf),
            verity_writer,
            verity_finalized: false,
            state: HashPartitionFutureState::PrepareRead,
        })
    }

    /// Number of bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.offset
    }

    fn poll_steps(&mut self, dev: &D, cx: &mut task::Context<'_>) -> task::Poll<Result<Vec<u8>, HashPartitionError>> {
        loop {
            match &mut self.state {
                HashPartitionFutureState::PrepareRead => {
                    let end = if self.offset < self.filesystem_data_end {
                        self.filesystem_data_end
                    } else if self.verity_writer.is_some() && !self.verity_finalized {
                        self.verity_finalized = true;
                        let finalize_fut = match self.verity_writer.as_mut().map(|w| w.finalize::<D>()) {
                            Some(Ok(finalize_fut)) => finalize_fut,
                            Some(Err(e)) => return task::Poll::Ready(Err(e.into())),
                            None => continue,
                        };
                        self.state = HashPartitionFutureState::FinalizeVerity { finalize_fut };
                        continue;
                    } else if self.offset < self.partition_size {
                        self.partition_size
                    } else {
                        let digest = match self.hasher.take() {
                            Some(hasher) => hasher.finalize(),
                            None => {
                                return task::Poll::Ready(Err(HashPartitionError::Read {
                                    offset: self.offset,
                                    source: otaverify_storage::partition_io_err_internal!(),
                                }));
                            }
                        };
                        self.buf = None;
                        return task::Poll::Ready(Ok(digest));
                    };

                    let len = (READ_CHUNK_SIZE as u64).min(end - self.offset) as usize;
                    let buf = self.buf.take().unwrap_or_default();
                    let request = match PartitionReadRequest::new(self.offset, buf, len) {
                        Ok(request) => request,
                        Err(e) => {
                            return task::Poll::Ready(Err(HashPartitionError::Read {
                                offset: self.offset,
                                source: e,
                            }));
                        }
                    };
                    let read_fut = match dev.read(request) {
                        Ok(Ok(read_fut)) => read_fut,
                        Ok(Err((_, e))) | Err(e) => {
                            return task::Poll::Ready(Err(HashPartitionError::Read {
                                offset: self.offset,
                                source: e,
                            }));
                        }
                    };
                    self.state = HashPartitionFutureState::Read { read_fut };
                }
                HashPartitionFutureState::Read { read_fut } => {
                    let (request, result) = match PartitionIoFuture::poll(pin::Pin::new(read_fut), dev, cx) {
                        task::Poll::Ready(Ok(completion)) => completion,
                        task::Poll::Ready(Err(e)) => {
                            return task::Poll::Ready(Err(HashPartitionError::Read {
                                offset: self.offset,
                                source: e,
                            }));
                        }
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let n = match result {
                        Ok(0) => return task::Poll::Ready(Err(HashPartitionError::UnexpectedEof(self.offset))),
                        Ok(n) => n,
                        Err(e) => {
                            return task::Poll::Ready(Err(HashPartitionError::Read {
                                offset: self.offset,
                                source: e,
                            }));
                        }
                    };

                    let data = &request.data()[..n];
                    if let Some(hasher) = self.hasher.as_mut() {
                        hasher.update(data);
                    }
                    if self.offset < self.filesystem_data_end {
                        if let Some(verity_writer) = self.verity_writer.as_mut() {
                            verity_writer.update(self.offset, data)?;
                        }
                    }
                    self.offset += n as u64;
                    self.buf = Some(request.into_buffer());
                    self.state = HashPartitionFutureState::Yield {
                        yield_now: YieldNow::new(),
                    };
                }
                HashPartitionFutureState::Yield { yield_now } => {
                    if yield_now.poll_yield(cx).is_pending() {
                        return task::Poll::Pending;
                    }
                    self.state = HashPartitionFutureState::PrepareRead;
                }
                HashPartitionFutureState::FinalizeVerity { finalize_fut } => {
                    match PartitionIoFuture::poll(pin::Pin::new(finalize_fut), dev, cx) {
                        task::Poll::Ready(Ok(())) => (),
                        task::Poll::Ready(Err(e)) => return task::Poll::Ready(Err(e.into())),
                        task::Poll::Pending => return task::Poll::Pending,
                    }
                    tracing::debug!(offset = self.offset, "verity metadata written");
                    self.state = HashPartitionFutureState::PrepareRead;
                }
                HashPartitionFutureState::Done => unreachable!("Attempt to poll completed future."),
            }
        }
    }
}

impl<D: PartitionIo, V: VerityWriter> PartitionIoFuture<D> for HashPartitionFuture<D, V> {
    type Output = (Option<V>, Result<Vec<u8>, HashPartitionError>);

    fn poll(self: pin::Pin<&mut Self>, dev: &D, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        match this.poll_steps(dev, cx) {
            task::Poll::Ready(result) => {
                this.state = HashPartitionFutureState::Done;
                task::Poll::Ready((this.verity_writer.take(), result))
            }
            task::Poll::Pending => task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otaverify_storage::blkdev::{
        PartitionIoFutureAsCoreFuture,
        test::{TestPartitionDevice, TestPartitionFaults},
    };
    use otaverify_storage::verity::DmVerityWriter;
    use otaverify_utils_async::test::TestAsyncExecutor;
    use std::sync::Arc;

    fn sha256(data: &[u8]) -> Vec<u8> {
        let mut h = HashInstance::new(HashAlg::Sha256);
        h.update(data);
        h.finalize()
    }

    fn hash_device(
        dev: TestPartitionDevice,
        partition_size: u64,
    ) -> (Arc<TestPartitionDevice>, Result<Vec<u8>, HashPartitionError>) {
        let dev = Arc::new(dev);
        let fut = HashPartitionFuture::<TestPartitionDevice, DmVerityWriter>::new(partition_size, partition_size, None)
            .map_err(|(_, e)| e)
            .unwrap();
        let executor = TestAsyncExecutor::new();
        let waiter = TestAsyncExecutor::spawn(&executor, PartitionIoFutureAsCoreFuture::new(dev.clone(), fut));
        TestAsyncExecutor::run_to_completion(&executor);
        let (verity_writer, result) = waiter.take().unwrap();
        assert!(verity_writer.is_none());
        (dev, result)
    }

    #[test]
    fn test_hash_multiple_chunks() {
        let data: Vec<u8> = (0..3 * READ_CHUNK_SIZE + 1000).map(|i| (i % 253) as u8).collect();
        let (dev, result) = hash_device(TestPartitionDevice::new(data.clone(), false), data.len() as u64);
        assert_eq!(result.unwrap(), sha256(&data));
        assert_eq!(dev.reads(), 4);
    }

    #[test]
    fn test_hash_prefix() {
        let data = vec![0x5au8; 10000];
        let (_, result) = hash_device(TestPartitionDevice::new(data.clone(), false), 1000);
        assert_eq!(result.unwrap(), sha256(&data[..1000]));
    }

    #[test]
    fn test_hash_empty() {
        let (dev, result) = hash_device(TestPartitionDevice::new(Vec::new(), false), 0);
        assert_eq!(result.unwrap(), sha256(&[]));
        assert_eq!(dev.reads(), 0);
    }

    #[test]
    fn test_unexpected_eof() {
        let (_, result) = hash_device(TestPartitionDevice::new(vec![0u8; 1000], false), 2000);
        assert!(matches!(result, Err(HashPartitionError::UnexpectedEof(1000))));
    }

    #[test]
    fn test_read_failure() {
        let mut dev = TestPartitionDevice::new(vec![0u8; 2 * READ_CHUNK_SIZE], false);
        dev.set_faults(TestPartitionFaults {
            max_read_len: None,
            fail_read_at: Some(READ_CHUNK_SIZE as u64 + 10),
        });
        let (_, result) = hash_device(dev, 2 * READ_CHUNK_SIZE as u64);
        assert!(matches!(
            result,
            Err(HashPartitionError::Read {
                offset,
                source: PartitionIoError::IoFailure
            }) if offset == READ_CHUNK_SIZE as u64
        ));
    }
}
