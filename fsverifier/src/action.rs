// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Pipeline integration of the filesystem verifier.

use crate::install_plan::InstallPlan;
use crate::verifier::{FilesystemVerifierDelegate, FilesystemVerifierFuture};
use otaverify_storage::blkdev::PartitionDevices;
use otaverify_storage::dynamic_partition::DynamicPartitionControl;
use otaverify_storage::verity::VerityWriter;
use otaverify_utils_async::asynchronous::{AbortHandle, AbortSignal, abort_pair};

/// The filesystem verification stage of the update pipeline.
///
/// Consumes the [`InstallPlan`] produced by the preceding stage and, on
/// success, forwards it unmodified to the next one.
pub struct FilesystemVerifierAction<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> {
    devices: P,
    dynamic_control: C,
    verity_writer: V,
    delegate: Option<Box<dyn FilesystemVerifierDelegate>>,
    abort_handle: AbortHandle,
    abort_signal: AbortSignal,
}

impl<P: PartitionDevices, C: DynamicPartitionControl, V: VerityWriter> FilesystemVerifierAction<P, C, V> {
    pub fn new(devices: P, dynamic_control: C, verity_writer: V) -> Self {
        let (abort_handle, abort_signal) = abort_pair();
        Self {
            devices,
            dynamic_control,
            verity_writer,
            delegate: None,
            abort_handle,
            abort_signal,
        }
    }

    pub fn type_name() -> &'static str {
        "FilesystemVerifierAction"
    }

    pub fn set_delegate(&mut self, delegate: Box<dyn FilesystemVerifierDelegate>) {
        self.delegate = Some(delegate);
    }

    /// Obtain a handle for [terminating](AbortHandle::abort) the processing
    /// from elsewhere, e.g. a delegate or another task.
    pub fn terminate_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Request cancellation of the verification.
    pub fn terminate_processing(&self) {
        tracing::info!(action = Self::type_name(), "terminating processing");
        self.abort_handle.abort();
    }

    /// Start the verification of `install_plan`.
    ///
    /// The returned [`Future`](std::future::Future) resolves to the plan to
    /// forward on success.
    pub fn perform_action(self, install_plan: Option<InstallPlan>) -> FilesystemVerifierFuture<P, C, V> {
        tracing::info!(action = Self::type_name(), "performing action");
        FilesystemVerifierFuture::new(
            self.devices,
            self.dynamic_control,
            self.verity_writer,
            install_plan,
            self.delegate,
            Some(self.abort_signal),
        )
    }
}
