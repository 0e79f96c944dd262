// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`PartitionIoSource`].

use otaverify_storage::blkdev::{
    PartitionIo, PartitionIoError, PartitionIoFuture, PartitionReadRequest, PartitionWriteRequest,
};
use otaverify_storage::partition_io_err_internal;
use std::{marker, pin, task};

/// The device a partition gets read through.
///
/// `DV` is the type of plain partition devices, `CV` the one of
/// copy-on-write snapshot handles.
pub enum PartitionIoSource<DV: PartitionIo, CV: PartitionIo> {
    /// The partition's block device.
    Direct(DV),
    /// A mapped read-only view of a dynamic partition.
    SnapshotMapped(DV),
    /// Raw access to a dynamic partition's copy-on-write snapshot.
    Cow(CV),
}

impl<DV: PartitionIo, CV: PartitionIo> PartitionIoSource<DV, CV> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::SnapshotMapped(_) => "snapshot-mapped",
            Self::Cow(_) => "copy-on-write",
        }
    }
}

/// [`PartitionIoFuture`] of a [`PartitionIoSource`], forwarding to the
/// respective variant's device future.
pub enum PartitionIoSourceFuture<DF, CF> {
    Device(DF),
    Cow(CF),
}

impl<DV, CV, DF, CF, T> PartitionIoFuture<PartitionIoSource<DV, CV>> for PartitionIoSourceFuture<DF, CF>
where
    DV: PartitionIo,
    CV: PartitionIo,
    DF: PartitionIoFuture<DV, Output = Result<T, PartitionIoError>> + marker::Unpin,
    CF: PartitionIoFuture<CV, Output = Result<T, PartitionIoError>> + marker::Unpin,
{
    type Output = Result<T, PartitionIoError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        dev: &PartitionIoSource<DV, CV>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        match (pin::Pin::into_inner(self), dev) {
            (Self::Device(fut), PartitionIoSource::Direct(dev) | PartitionIoSource::SnapshotMapped(dev)) => {
                PartitionIoFuture::poll(pin::Pin::new(fut), dev, cx)
            }
            (Self::Cow(fut), PartitionIoSource::Cow(dev)) => PartitionIoFuture::poll(pin::Pin::new(fut), dev, cx),
            _ => task::Poll::Ready(Err(partition_io_err_internal!())),
        }
    }
}

impl<DV: PartitionIo, CV: PartitionIo> PartitionIo for PartitionIoSource<DV, CV> {
    fn is_writable(&self) -> bool {
        match self {
            Self::Direct(dev) | Self::SnapshotMapped(dev) => dev.is_writable(),
            Self::Cow(dev) => dev.is_writable(),
        }
    }

    fn size(&self) -> Option<u64> {
        match self {
            Self::Direct(dev) | Self::SnapshotMapped(dev) => dev.size(),
            Self::Cow(dev) => dev.size(),
        }
    }

    type ReadFuture = PartitionIoSourceFuture<DV::ReadFuture, CV::ReadFuture>;

    fn read(
        &self,
        request: PartitionReadRequest,
    ) -> Result<Result<Self::ReadFuture, (PartitionReadRequest, PartitionIoError)>, PartitionIoError> {
        Ok(match self {
            Self::Direct(dev) | Self::SnapshotMapped(dev) => dev.read(request)?.map(PartitionIoSourceFuture::Device),
            Self::Cow(dev) => dev.read(request)?.map(PartitionIoSourceFuture::Cow),
        })
    }

    type WriteFuture = PartitionIoSourceFuture<DV::WriteFuture, CV::WriteFuture>;

    fn write(
        &self,
        request: PartitionWriteRequest,
    ) -> Result<Result<Self::WriteFuture, (PartitionWriteRequest, PartitionIoError)>, PartitionIoError> {
        Ok(match self {
            Self::Direct(dev) | Self::SnapshotMapped(dev) => dev.write(request)?.map(PartitionIoSourceFuture::Device),
            Self::Cow(dev) => dev.write(request)?.map(PartitionIoSourceFuture::Cow),
        })
    }

    type WriteSyncFuture = PartitionIoSourceFuture<DV::WriteSyncFuture, CV::WriteSyncFuture>;

    fn write_sync(&self) -> Result<Self::WriteSyncFuture, PartitionIoError> {
        Ok(match self {
            Self::Direct(dev) | Self::SnapshotMapped(dev) => PartitionIoSourceFuture::Device(dev.write_sync()?),
            Self::Cow(dev) => PartitionIoSourceFuture::Cow(dev.write_sync()?),
        })
    }
}
