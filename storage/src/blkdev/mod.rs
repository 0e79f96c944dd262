// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Definition of the [`PartitionIo`] trait, an asynchronous byte addressed
//! partition device abstraction.

mod file;
pub use file::{FilePartitionDevice, FilePartitionDevices};


use std::{fmt, future, io, marker, ops, pin, task};

/// Error type returned by [`PartitionIo`] primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionIoError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// Some requested operation is not supported.
    OperationNotSupported,

    /// Read or write region out of the partition's bounds.
    OutOfRange,

    /// The partition device does not exist.
    NotFound,

    /// Insufficient permissions for accessing the partition device.
    PermissionDenied,

    /// Attempt to write to a partition device opened for reading only.
    ReadOnly,

    /// Unspecified IO failure.
    IoFailure,
}

impl fmt::Display for PartitionIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Internal => "internal error",
            Self::MemoryAllocationFailure => "memory allocation failure",
            Self::OperationNotSupported => "operation not supported",
            Self::OutOfRange => "access out of range",
            Self::NotFound => "no such device",
            Self::PermissionDenied => "permission denied",
            Self::ReadOnly => "device opened read-only",
            Self::IoFailure => "IO failure",
        };
        f.write_str(s)
    }
}

impl std::error::Error for PartitionIoError {}

impl From<io::Error> for PartitionIoError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnly,
            io::ErrorKind::Unsupported | io::ErrorKind::NotSeekable => Self::OperationNotSupported,
            io::ErrorKind::FileTooLarge | io::ErrorKind::UnexpectedEof => Self::OutOfRange,
            io::ErrorKind::OutOfMemory => Self::MemoryAllocationFailure,
            _ => Self::IoFailure,
        }
    }
}

/// Return a [`PartitionIoError::Internal`], or panic in debug builds.
#[macro_export]
macro_rules! partition_io_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("PartitionIoError::Internal");
        } else {
            $crate::blkdev::PartitionIoError::Internal
        }
    }};
}

/// Read request to be submitted to [`PartitionIo::read()`].
///
/// The request owns the destination buffer for the duration of the read and
/// gets handed back on completion. At most `len` bytes get read into the
/// buffer's head.
pub struct PartitionReadRequest {
    offset: u64,
    buf: Vec<u8>,
    len: usize,
}

impl PartitionReadRequest {
    /// Create a read request for up to `len` bytes at `offset`.
    ///
    /// `buf` gets grown to `len` bytes if needed.
    pub fn new(offset: u64, mut buf: Vec<u8>, len: usize) -> Result<Self, PartitionIoError> {
        if buf.len() < len {
            buf.try_reserve_exact(len - buf.len())
                .map_err(|_| PartitionIoError::MemoryAllocationFailure)?;
            buf.resize(len, 0u8);
        }
        Ok(Self { offset, buf, len })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The destination region within the buffer.
    pub fn dst_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// The buffer's head, as filled by a completed read.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }
}

/// Write request to be submitted to [`PartitionIo::write()`].
pub struct PartitionWriteRequest {
    offset: u64,
    data: Vec<u8>,
}

impl PartitionWriteRequest {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self { offset, data }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Future trait implemented by all [`PartitionIo`] related futures.
///
/// `PartitionIoFuture` differs from the standard [Rust
/// `Future`](future::Future) only in that it takes an additional `dev`
/// argument, thereby avoiding the need for the futures to hold references to
/// the device they operate on. In cases where a proper Rust
/// [`Future`](future::Future) is needed, a [`PartitionIoFuture`] may get
/// wrapped in a [`PartitionIoFutureAsCoreFuture`].
pub trait PartitionIoFuture<D: ?Sized + PartitionIo> {
    type Output;

    /// Poll on a [`PartitionIoFuture`].
    ///
    /// Completely analogous to the standard [Rust
    /// `Future::poll()`](future::Future::poll), except for the
    /// additional `dev` argument.
    ///
    /// # Arguments:
    ///
    /// * `dev` - The [`PartitionIo`] instance the [`PartitionIoFuture`] had
    ///   been obtained from.
    /// * `cx` - The context of an asynchronous task.
    fn poll(self: pin::Pin<&mut Self>, dev: &D, cx: &mut task::Context<'_>) -> task::Poll<Self::Output>;
}

/// Trait defining an interface to a partition's backing storage.
///
/// Partitions are addressed at byte granularity. A read may return fewer
/// bytes than requested, e.g. at the end of the device, and returns zero
/// bytes only if the offset is at or beyond the end.
///
/// All operations are asynchronous and return a [`PartitionIoFuture`] to be
/// polled to completion. Dropping such a future before completion abandons
/// the operation: a read's destination buffer content is unspecified then, a
/// write may or may not have taken effect.
pub trait PartitionIo: marker::Send + marker::Sync + marker::Unpin {
    /// Whether the device had been opened for writing.
    fn is_writable(&self) -> bool;

    /// Size of the device in bytes, if known.
    fn size(&self) -> Option<u64>;

    /// [`PartitionIoFuture`] type returned by [`read()`](Self::read).
    ///
    /// On completion, the original request is handed back together with
    /// the number of bytes actually read.
    type ReadFuture: PartitionIoFuture<
            Self,
            Output = Result<(PartitionReadRequest, Result<usize, PartitionIoError>), PartitionIoError>,
        > + marker::Send
        + marker::Unpin;

    /// Read from the device.
    ///
    /// On immediate failure, the request is handed back together with the
    /// error in the inner result.
    #[allow(clippy::type_complexity)]
    fn read(
        &self,
        request: PartitionReadRequest,
    ) -> Result<Result<Self::ReadFuture, (PartitionReadRequest, PartitionIoError)>, PartitionIoError>;

    /// [`PartitionIoFuture`] type returned by [`write()`](Self::write).
    type WriteFuture: PartitionIoFuture<
            Self,
            Output = Result<(PartitionWriteRequest, Result<(), PartitionIoError>), PartitionIoError>,
        > + marker::Send
        + marker::Unpin;

    /// Write the request's data in full.
    #[allow(clippy::type_complexity)]
    fn write(
        &self,
        request: PartitionWriteRequest,
    ) -> Result<Result<Self::WriteFuture, (PartitionWriteRequest, PartitionIoError)>, PartitionIoError>;

    /// [`PartitionIoFuture`] type returned by [`write_sync()`](Self::write_sync).
    type WriteSyncFuture: PartitionIoFuture<Self, Output = Result<(), PartitionIoError>> + marker::Send + marker::Unpin;

    /// Flush all completed writes to the backing storage.
    fn write_sync(&self) -> Result<Self::WriteSyncFuture, PartitionIoError>;
}

/// Means to open partition devices by path.
pub trait PartitionDevices {
    type Device: PartitionIo;

    /// Set or clear the kernel's read-only flag of a block device.
    ///
    /// Paths not referring to a block device are left alone.
    fn set_read_only(&self, path: &str, read_only: bool) -> Result<(), PartitionIoError>;

    /// Open the partition device at `path`.
    fn open(&self, path: &str, writable: bool) -> Result<Self::Device, PartitionIoError>;
}

/// [`PartitionIoFuture`] adaptor implementing the standard [Rust
/// `Future`](future::Future) trait.
///
/// The device is held through any [`Deref`](ops::Deref) handle, i.e. either a
/// plain reference or some shared ownership pointer like [`Arc`](std::sync::Arc).
pub struct PartitionIoFutureAsCoreFuture<DR, F> {
    dev: DR,
    fut: F,
}

impl<DR, F> PartitionIoFutureAsCoreFuture<DR, F>
where
    DR: ops::Deref,
    DR::Target: PartitionIo,
    F: PartitionIoFuture<DR::Target> + marker::Unpin,
{
    /// Wrap a [`PartitionIoFuture`] in a new [`PartitionIoFutureAsCoreFuture`].
    ///
    /// # Arguments:
    ///
    /// * `dev` - The [`PartitionIo`] instance the [`PartitionIoFuture`] `fut`
    ///   had been obtained from.
    /// * `fut` - The [`PartitionIoFuture`] to wrap.
    pub fn new(dev: DR, fut: F) -> Self {
        Self { dev, fut }
    }
}

impl<DR, F> future::Future for PartitionIoFutureAsCoreFuture<DR, F>
where
    DR: ops::Deref + marker::Unpin,
    DR::Target: PartitionIo,
    F: PartitionIoFuture<DR::Target> + marker::Unpin,
{
    type Output = F::Output;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        PartitionIoFuture::poll(pin::Pin::new(&mut this.fut), &*this.dev, cx)
    }
}
