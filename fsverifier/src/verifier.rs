// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`FilesystemVerifierFuture`], the partition verification
//! state machine.

use crate::error::VerifierError;
use crate::hasher::{HashPartitionError, HashPartitionFuture, PARTITION_HASH_ALG};
use crate::install_plan::{InstallPlan, Partition};
use crate::io_source::PartitionIoSource;
use crate::layout;
use crate::verifier_err_internal;
use base64::Engine as _;
use otaverify_crypto::hash::{HashInstance, digests_eq};
use otaverify_storage::blkdev::{PartitionDevices, PartitionIoError, PartitionIoFuture};
use otaverify_storage::dynamic_partition::DynamicPartitionControl;
use otaverify_storage::verity::VerityWriter;
use otaverify_utils_async::asynchronous::AbortSignal;
use std::{fmt, future, marker, pin, task};


/// Which of a partition's two slots is being verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifierStep {
    VerifyTarget,
    VerifySource,
}

impl fmt::Display for VerifierStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerifyTarget => f.write_str("target"),
            Self::VerifySource => f.write_str("source"),
        }
    }
}

/// Receiver of verification progress updates.
pub trait FilesystemVerifierDelegate: marker::Send {
    /// Overall progress, in the range from 0.0 to 1.0.
    fn on_verify_progress_update(&mut self, progress: f64);
}

type IoSource<P, C> =
    PartitionIoSource<<P as PartitionDevices>::Device, <C as DynamicPartitionControl>::CowDevice>;

enum FilesystemVerifierState<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> {
    Init,
    StartPartitionHashing,
    HashPartition {
        io: IoSource<P, C>,
        hash_fut: HashPartitionFuture<IoSource<P, C>, V>,
        partition_size: u64,
        last_reported: u64,
    },
    VerifyUntouchedExtents,
    Done,
}

fn b64(digest: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest)
}

fn report_progress(delegate: &mut Option<Box<dyn FilesystemVerifierDelegate>>, progress: f64) {
    if let Some(delegate) = delegate.as_mut() {
        delegate.on_verify_progress_update(progress);
    }
}

/// Verify all partitions of an [`InstallPlan`].
///
/// The partitions get verified one after another, in the plan's order, by
/// reading them through a [`HashPartitionFuture`]. A target partition whose
/// digest mismatches gets diagnosed by verifying the corresponding source
/// partition, if the update is a delta update: a correct source proves the
/// update itself to be invalid.
///
/// Resolves to the unmodified plan on success. Dropping the future before
/// completion cancels the verification, as does an abort request delivered
/// through the [`AbortSignal`].
pub struct FilesystemVerifierFuture<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> {
    devices: P,
    dynamic_control: C,
    verity_writer: Option<V>,
    delegate: Option<Box<dyn FilesystemVerifierDelegate>>,
    abort_signal: Option<AbortSignal>,
    plan: Option<InstallPlan>,
    write_verity: bool,
    partition_index: usize,
    step: VerifierStep,
    /// Digest of the current partition's mismatching target.
    target_digest: Option<Vec<u8>>,
    /// Highest progress reported so far. A source step revisits the same
    /// partition index and must not move the progress backwards.
    max_progress: f64,
    cleaned_up: bool,
    state: FilesystemVerifierState<P, C, V>,
}

impl<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> FilesystemVerifierFuture<P, C, V> {
    pub fn new(
        devices: P,
        dynamic_control: C,
        verity_writer: V,
        plan: Option<InstallPlan>,
        delegate: Option<Box<dyn FilesystemVerifierDelegate>>,
        abort_signal: Option<AbortSignal>,
    ) -> Self {
        Self {
            devices,
            dynamic_control,
            verity_writer: Some(verity_writer),
            delegate,
            abort_signal,
            plan,
            write_verity: true,
            partition_index: 0,
            step: VerifierStep::VerifyTarget,
            target_digest: None,
            max_progress: 0.0,
            cleaned_up: false,
            state: FilesystemVerifierState::Init,
        }
    }

    fn current_partition_name(&self) -> String {
        self.plan
            .as_ref()
            .and_then(|plan| plan.partitions.get(self.partition_index))
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn progress(partition_index: usize, partitions: usize, bytes_hashed: u64, partition_size: u64) -> f64 {
        if partitions == 0 {
            return 1.0;
        }
        let partition_progress = if partition_size == 0 {
            0.0
        } else {
            bytes_hashed as f64 / partition_size as f64
        };
        (partition_index as f64 + partition_progress) / partitions as f64
    }

    fn poll_steps(&mut self, cx: &mut task::Context<'_>) -> task::Poll<Result<InstallPlan, VerifierError>> {
        loop {
            match &mut self.state {
                FilesystemVerifierState::Init => {
                    let plan = match self.plan.as_ref() {
                        Some(plan) => plan,
                        None => {
                            tracing::error!("no install plan given");
                            return task::Poll::Ready(Err(VerifierError::MissingInputObject));
                        }
                    };
                    plan.dump();
                    self.write_verity = plan.write_verity;
                    if plan.partitions.is_empty() {
                        tracing::info!("no partitions to verify");
                    }
                    self.state = FilesystemVerifierState::StartPartitionHashing;
                }
                FilesystemVerifierState::StartPartitionHashing => {
                    self.state = match self.start_partition_hashing() {
                        Ok(Some(state)) => state,
                        Ok(None) => FilesystemVerifierState::VerifyUntouchedExtents,
                        Err(e) => return task::Poll::Ready(Err(e)),
                    };
                }
                FilesystemVerifierState::HashPartition {
                    io,
                    hash_fut,
                    partition_size,
                    last_reported,
                } => {
                    let poll = PartitionIoFuture::poll(pin::Pin::new(hash_fut), io, cx);

                    let bytes_hashed = hash_fut.bytes_hashed();
                    if bytes_hashed != *last_reported {
                        *last_reported = bytes_hashed;
                        let partitions = self.plan.as_ref().map(|plan| plan.partitions.len()).unwrap_or(0);
                        let progress = Self::progress(self.partition_index, partitions, bytes_hashed, *partition_size);
                        if progress > self.max_progress {
                            self.max_progress = progress;
                            report_progress(&mut self.delegate, progress);
                        }
                    }

                    let (verity_writer, result) = match poll {
                        task::Poll::Ready(completion) => completion,
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    if verity_writer.is_some() {
                        self.verity_writer = verity_writer;
                    }
                    // Release the device before moving on.
                    self.state = FilesystemVerifierState::StartPartitionHashing;
                    let digest = match result {
                        Ok(digest) => digest,
                        Err(e) => return task::Poll::Ready(Err(self.hash_error(e))),
                    };
                    if let Err(e) = self.finish_partition_step(digest) {
                        return task::Poll::Ready(Err(e));
                    }
                }
                FilesystemVerifierState::VerifyUntouchedExtents => {
                    let plan = self.plan.take().ok_or_else(|| verifier_err_internal!())?;
                    if !plan.untouched_dynamic_partitions.is_empty() {
                        tracing::info!(
                            partitions = ?plan.untouched_dynamic_partitions,
                            "verifying extents of untouched dynamic partitions"
                        );
                        if !self.dynamic_control.verify_extents_for_untouched_partitions(
                            plan.source_slot,
                            plan.target_slot,
                            &plan.untouched_dynamic_partitions,
                        ) {
                            tracing::error!("extents of untouched dynamic partitions mismatch");
                            return task::Poll::Ready(Err(VerifierError::UntouchedPartitionExtentsMismatch));
                        }
                    }
                    return task::Poll::Ready(Ok(plan));
                }
                FilesystemVerifierState::Done => unreachable!("Attempt to poll completed future."),
            }
        }
    }

    /// Set up the hashing of the current partition and step.
    ///
    /// Partitions without a device and of zero size get skipped. Returns
    /// `None` once all partitions are done.
    fn start_partition_hashing(&mut self) -> Result<Option<FilesystemVerifierState<P, C, V>>, VerifierError> {
        let plan = self.plan.as_ref().ok_or_else(|| verifier_err_internal!())?;
        loop {
            let partition = match plan.partitions.get(self.partition_index) {
                Some(partition) => partition,
                None => return Ok(None),
            };
            let (path, size) = match self.step {
                VerifierStep::VerifyTarget => (partition.target_path.as_str(), partition.target_size),
                VerifierStep::VerifySource => (partition.source_path.as_str(), partition.source_size),
            };

            if path.is_empty() {
                if size != 0 {
                    tracing::error!(partition = %partition.name, step = %self.step, size, "no device path resolved");
                    return Err(VerifierError::UnresolvedDevicePath {
                        partition: partition.name.clone(),
                        step: self.step,
                    });
                }
                if self.step == VerifierStep::VerifySource {
                    // An absent source is an empty one.
                    let empty_digest = HashInstance::new(PARTITION_HASH_ALG).finalize();
                    if !digests_eq(&empty_digest, &partition.source_hash) {
                        tracing::error!(
                            partition = %partition.name,
                            expected = %b64(&partition.source_hash),
                            calculated = %b64(&empty_digest),
                            "source partition is empty but its expected hash is not"
                        );
                        return Err(VerifierError::SourceVerification {
                            partition: partition.name.clone(),
                            expected: partition.source_hash.clone(),
                            calculated: empty_digest,
                        });
                    }
                    tracing::error!(
                        partition = %partition.name,
                        "target partition mismatches and the empty source partition verified"
                    );
                    return Err(VerifierError::TargetVerification {
                        partition: partition.name.clone(),
                        expected: partition.target_hash.clone(),
                        calculated: self.target_digest.take().unwrap_or_default(),
                    });
                }
                tracing::info!(partition = %partition.name, "skipping empty partition");
                self.partition_index += 1;
                continue;
            }

            let filesystem_data_end = layout::filesystem_data_end(partition, self.step, size).map_err(|source| {
                tracing::error!(partition = %partition.name, error = %source, "invalid verity layout");
                VerifierError::InvalidVerityLayout {
                    partition: partition.name.clone(),
                    source,
                }
            })?;
            let write_verity =
                self.step == VerifierStep::VerifyTarget && plan.write_verity && partition.has_verity_metadata();
            tracing::info!(
                partition = %partition.name,
                step = %self.step,
                path,
                size,
                filesystem_data_end,
                write_verity,
                "hashing partition"
            );

            let io = Self::open_io_source(
                &self.devices,
                &self.dynamic_control,
                plan,
                partition,
                self.step,
                path,
                write_verity,
            )?;

            let verity_writer = if write_verity {
                let mut verity_writer = self.verity_writer.take().ok_or_else(|| verifier_err_internal!())?;
                if let Err(source) = verity_writer.init(&partition.verity_layout()) {
                    tracing::error!(partition = %partition.name, error = %source, "failed to initialize verity writer");
                    self.verity_writer = Some(verity_writer);
                    return Err(VerifierError::VerityComputation {
                        partition: partition.name.clone(),
                        source,
                    });
                }
                Some(verity_writer)
            } else {
                None
            };

            let hash_fut = match HashPartitionFuture::new(size, filesystem_data_end, verity_writer) {
                Ok(hash_fut) => hash_fut,
                Err((verity_writer, source)) => {
                    if verity_writer.is_some() {
                        self.verity_writer = verity_writer;
                    }
                    return Err(VerifierError::Read {
                        partition: partition.name.clone(),
                        offset: 0,
                        source,
                    });
                }
            };

            return Ok(Some(FilesystemVerifierState::HashPartition {
                io,
                hash_fut,
                partition_size: size,
                last_reported: 0,
            }));
        }
    }

    fn open_io_source(
        devices: &P,
        dynamic_control: &C,
        plan: &InstallPlan,
        partition: &Partition,
        step: VerifierStep,
        path: &str,
        write_verity: bool,
    ) -> Result<IoSource<P, C>, VerifierError> {
        let open_error = |path: &str, source: PartitionIoError| {
            tracing::error!(partition = %partition.name, path, error = %source, "failed to open partition");
            VerifierError::Open {
                partition: partition.name.clone(),
                path: path.to_owned(),
                source,
            }
        };

        if step == VerifierStep::VerifyTarget
            && dynamic_control.update_uses_snapshot_compression()
            && dynamic_control.is_dynamic_partition(&partition.name, plan.target_slot)
        {
            if write_verity {
                // The verity metadata must go to the snapshot, which is only
                // accessible through the copy-on-write device.
                let dev = dynamic_control
                    .open_cow_device(&partition.name, &partition.source_path, true)
                    .map_err(|e| open_error(&partition.name, e))?;
                return Ok(PartitionIoSource::Cow(dev));
            }

            if !dynamic_control.unmap_all_partitions() {
                tracing::warn!("failed to unmap partitions");
            }
            if !dynamic_control.map_all_partitions() {
                tracing::warn!("failed to map partitions");
            }
            let path = partition.effective_readonly_target_path();
            let dev = devices.open(path, false).map_err(|e| open_error(path, e))?;
            return Ok(PartitionIoSource::SnapshotMapped(dev));
        }

        if let Err(e) = devices.set_read_only(path, !write_verity) {
            tracing::warn!(path, read_only = !write_verity, error = %e, "failed to set block device read-only flag");
        }
        let dev = devices.open(path, write_verity).map_err(|e| open_error(path, e))?;
        Ok(PartitionIoSource::Direct(dev))
    }

    fn hash_error(&self, e: HashPartitionError) -> VerifierError {
        let partition = self.current_partition_name();
        tracing::error!(partition = %partition, step = %self.step, error = %e, "failed to hash partition");
        match e {
            HashPartitionError::Read { offset, source } => VerifierError::Read {
                partition,
                offset,
                source,
            },
            HashPartitionError::UnexpectedEof(offset) => VerifierError::UnexpectedEof { partition, offset },
            HashPartitionError::Verity(source) => VerifierError::VerityComputation { partition, source },
        }
    }

    /// Check the digest of the current partition and step and advance.
    fn finish_partition_step(&mut self, digest: Vec<u8>) -> Result<(), VerifierError> {
        let plan = self.plan.as_ref().ok_or_else(|| verifier_err_internal!())?;
        let partition = plan
            .partitions
            .get(self.partition_index)
            .ok_or_else(|| verifier_err_internal!())?;

        match self.step {
            VerifierStep::VerifyTarget => {
                if digests_eq(&digest, &partition.target_hash) {
                    tracing::info!(partition = %partition.name, hash = %b64(&digest), "target partition verified");
                    self.partition_index += 1;
                    Ok(())
                } else if partition.source_hash.is_empty() {
                    tracing::error!(
                        partition = %partition.name,
                        expected = %b64(&partition.target_hash),
                        calculated = %b64(&digest),
                        "target partition hash mismatch"
                    );
                    Err(VerifierError::TargetVerification {
                        partition: partition.name.clone(),
                        expected: partition.target_hash.clone(),
                        calculated: digest,
                    })
                } else {
                    tracing::warn!(
                        partition = %partition.name,
                        expected = %b64(&partition.target_hash),
                        calculated = %b64(&digest),
                        "target partition hash mismatch, verifying source partition"
                    );
                    self.target_digest = Some(digest);
                    self.step = VerifierStep::VerifySource;
                    Ok(())
                }
            }
            VerifierStep::VerifySource => {
                let target_digest = self.target_digest.take().unwrap_or_default();
                if !digests_eq(&digest, &partition.source_hash) {
                    tracing::error!(
                        partition = %partition.name,
                        expected = %b64(&partition.source_hash),
                        calculated = %b64(&digest),
                        "source partition hash mismatch, the device's current slot is corrupt"
                    );
                    tracing::error!(
                        "to hash the source partition, run: sha256sum {} | xxd -r -p | base64",
                        partition.source_path
                    );
                    Err(VerifierError::SourceVerification {
                        partition: partition.name.clone(),
                        expected: partition.source_hash.clone(),
                        calculated: digest,
                    })
                } else {
                    tracing::error!(
                        partition = %partition.name,
                        "source partition verified but target partition mismatches, the update is invalid"
                    );
                    Err(VerifierError::TargetVerification {
                        partition: partition.name.clone(),
                        expected: partition.target_hash.clone(),
                        calculated: target_digest,
                    })
                }
            }
        }
    }

    /// Release all resources held for the verification.
    ///
    /// Idempotent, invoked on completion and on drop.
    fn cleanup(&mut self) {
        self.state = FilesystemVerifierState::Done;
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        if !self.write_verity
            && self.dynamic_control.update_uses_snapshot_compression()
            && !self.dynamic_control.unmap_all_partitions()
        {
            tracing::warn!("failed to unmap partitions");
        }
    }
}

impl<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> marker::Unpin
    for FilesystemVerifierFuture<P, C, V>
{
}

impl<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> future::Future
    for FilesystemVerifierFuture<P, C, V>
{
    type Output = Result<InstallPlan, VerifierError>;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        if matches!(this.state, FilesystemVerifierState::Done) {
            unreachable!("Attempt to poll completed future.");
        }

        if let Some(abort_signal) = this.abort_signal.as_ref() {
            abort_signal.register(cx.waker());
            if abort_signal.is_aborted() {
                tracing::info!(partition = %this.current_partition_name(), "filesystem verification cancelled");
                this.cleanup();
                return task::Poll::Ready(Err(VerifierError::Cancelled));
            }
        }

        let result = match this.poll_steps(cx) {
            task::Poll::Ready(result) => result,
            task::Poll::Pending => return task::Poll::Pending,
        };
        this.cleanup();
        report_progress(&mut this.delegate, 1.0);
        match &result {
            Ok(plan) => tracing::info!(partitions = plan.partitions.len(), "all partitions verified"),
            Err(e) => tracing::error!(error = %e, code = %e.error_code(), "filesystem verification failed"),
        }
        task::Poll::Ready(result)
    }
}

impl<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> Drop for FilesystemVerifierFuture<P, C, V> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
