// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`FilePartitionDevice`], a [`PartitionIo`] trait
//! implementation based on Rust `std` [`File`] IO primitives.

use super::{
    PartitionDevices, PartitionIo, PartitionIoError, PartitionIoFuture, PartitionReadRequest, PartitionWriteRequest,
};
use crate::partition_io_err_internal;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    pin, sync, task,
};

/// [`PartitionIo`] trait implementation based on Rust `std` [`File`] IO
/// primitives.
///
/// Operations are carried out synchronously from the respective future's
/// first [`poll()`](PartitionIoFuture::poll).
pub struct FilePartitionDevice {
    file: sync::Mutex<File>,
    path: String,
    writable: bool,
    size: Option<u64>,
}

impl FilePartitionDevice {
    pub fn new(file: File, path: &str, writable: bool) -> Self {
        let size = file_size(&file);
        Self {
            file: sync::Mutex::new(file),
            path: path.to_owned(),
            writable,
            size,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock_file(&self) -> sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(sync::PoisonError::into_inner)
    }
}

fn file_size(file: &File) -> Option<u64> {
    let meta = file.metadata().ok()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt as _;
        if meta.file_type().is_block_device() {
            // The metadata of block devices reports a zero length, seek to the
            // end instead.
            let mut file = file;
            let size = file.seek(SeekFrom::End(0)).ok();
            let _ = file.seek(SeekFrom::Start(0));
            return size;
        }
    }
    Some(meta.len())
}

impl PartitionIo for FilePartitionDevice {
    fn is_writable(&self) -> bool {
        self.writable
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    type ReadFuture = FilePartitionDeviceReadFuture;

    fn read(
        &self,
        request: PartitionReadRequest,
    ) -> Result<Result<Self::ReadFuture, (PartitionReadRequest, PartitionIoError)>, PartitionIoError> {
        Ok(Ok(FilePartitionDeviceReadFuture { request: Some(request) }))
    }

    type WriteFuture = FilePartitionDeviceWriteFuture;

    fn write(
        &self,
        request: PartitionWriteRequest,
    ) -> Result<Result<Self::WriteFuture, (PartitionWriteRequest, PartitionIoError)>, PartitionIoError> {
        if !self.writable {
            return Ok(Err((request, PartitionIoError::ReadOnly)));
        }
        Ok(Ok(FilePartitionDeviceWriteFuture { request: Some(request) }))
    }

    type WriteSyncFuture = FilePartitionDeviceWriteSyncFuture;

    fn write_sync(&self) -> Result<Self::WriteSyncFuture, PartitionIoError> {
        Ok(FilePartitionDeviceWriteSyncFuture)
    }
}

/// [`PartitionIo::ReadFuture`] implementation for [`FilePartitionDevice`].
pub struct FilePartitionDeviceReadFuture {
    request: Option<PartitionReadRequest>,
}

impl PartitionIoFuture<FilePartitionDevice> for FilePartitionDeviceReadFuture {
    type Output = Result<(PartitionReadRequest, Result<usize, PartitionIoError>), PartitionIoError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        dev: &FilePartitionDevice,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        let mut request = match this.request.take() {
            Some(request) => request,
            None => return task::Poll::Ready(Err(partition_io_err_internal!())),
        };

        let mut file = dev.lock_file();
        let offset = request.offset();
        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            tracing::error!(path = %dev.path, offset, error = %e, "partition seek for read failed");
            return task::Poll::Ready(Ok((request, Err(PartitionIoError::from(e)))));
        }

        // Fill as much of the buffer as possible, a short count is returned only
        // at the end of the file.
        let dst = request.dst_mut();
        let mut filled = 0;
        while filled < dst.len() {
            match file.read(&mut dst[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(path = %dev.path, offset, error = %e, "partition read failed");
                    return task::Poll::Ready(Ok((request, Err(PartitionIoError::from(e)))));
                }
            }
        }

        task::Poll::Ready(Ok((request, Ok(filled))))
    }
}

/// [`PartitionIo::WriteFuture`] implementation for [`FilePartitionDevice`].
pub struct FilePartitionDeviceWriteFuture {
    request: Option<PartitionWriteRequest>,
}

impl PartitionIoFuture<FilePartitionDevice> for FilePartitionDeviceWriteFuture {
    type Output = Result<(PartitionWriteRequest, Result<(), PartitionIoError>), PartitionIoError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        dev: &FilePartitionDevice,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        let request = match this.request.take() {
            Some(request) => request,
            None => return task::Poll::Ready(Err(partition_io_err_internal!())),
        };

        let mut file = dev.lock_file();
        let offset = request.offset();
        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            tracing::error!(path = %dev.path, offset, error = %e, "partition seek for write failed");
            return task::Poll::Ready(Ok((request, Err(PartitionIoError::from(e)))));
        }
        if let Err(e) = file.write_all(request.data()) {
            tracing::error!(
                path = %dev.path,
                offset,
                size = request.data().len(),
                error = %e,
                "partition write failed"
            );
            return task::Poll::Ready(Ok((request, Err(PartitionIoError::from(e)))));
        }

        task::Poll::Ready(Ok((request, Ok(()))))
    }
}

/// [`PartitionIo::WriteSyncFuture`] implementation for [`FilePartitionDevice`].
pub struct FilePartitionDeviceWriteSyncFuture;

impl PartitionIoFuture<FilePartitionDevice> for FilePartitionDeviceWriteSyncFuture {
    type Output = Result<(), PartitionIoError>;

    fn poll(
        self: pin::Pin<&mut Self>,
        dev: &FilePartitionDevice,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<Self::Output> {
        let file = dev.lock_file();
        let result = file.sync_data().map_err(|e| {
            tracing::error!(path = %dev.path, error = %e, "partition sync failed");
            PartitionIoError::from(e)
        });
        task::Poll::Ready(result)
    }
}

/// [`PartitionDevices`] implementation opening device nodes or image files
/// from the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilePartitionDevices;

impl FilePartitionDevices {
    pub fn new() -> Self {
        Self
    }
}

impl PartitionDevices for FilePartitionDevices {
    type Device = FilePartitionDevice;

    #[cfg(target_os = "linux")]
    fn set_read_only(&self, path: &str, read_only: bool) -> Result<(), PartitionIoError> {
        use std::os::unix::fs::FileTypeExt as _;
        use std::os::unix::io::AsRawFd as _;

        // _IO(0x12, 93)
        const BLKROSET: libc::c_ulong = 0x125d;

        let file = File::open(path)?;
        if !file.metadata()?.file_type().is_block_device() {
            return Ok(());
        }

        let flag: libc::c_int = read_only as libc::c_int;
        // Safety: BLKROSET reads a single int through the pointer, which is
        // valid for the duration of the call.
        let r = unsafe { libc::ioctl(file.as_raw_fd(), BLKROSET as _, &flag as *const libc::c_int) };
        if r != 0 {
            let e = io::Error::last_os_error();
            tracing::debug!(path, read_only, error = %e, "BLKROSET ioctl failed");
            return Err(PartitionIoError::from(e));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_read_only(&self, _path: &str, _read_only: bool) -> Result<(), PartitionIoError> {
        Ok(())
    }

    fn open(&self, path: &str, writable: bool) -> Result<Self::Device, PartitionIoError> {
        let file = OpenOptions::new().read(true).write(writable).open(path).map_err(|e| {
            tracing::error!(path, writable, error = %e, "unable to open partition device");
            PartitionIoError::from(e)
        })?;
        Ok(FilePartitionDevice::new(file, path, writable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkdev::PartitionIoFutureAsCoreFuture;
    use std::future::Future as _;
    use std::io::Write as _;

    fn poll_ready<F: std::future::Future>(fut: F) -> F::Output {
        let mut fut = std::pin::pin!(fut);
        let mut cx = task::Context::from_waker(task::Waker::noop());
        match fut.as_mut().poll(&mut cx) {
            task::Poll::Ready(output) => output,
            task::Poll::Pending => panic!("file partition device future not ready on first poll"),
        }
    }

    #[test]
    fn test_file_partition_device_read_write() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&[0xa5u8; 1000]).unwrap();
        let path = image.path().to_str().unwrap().to_owned();

        let devices = FilePartitionDevices::new();
        let dev = devices.open(&path, true).unwrap();
        assert_eq!(dev.size(), Some(1000));
        assert!(dev.is_writable());

        let write = dev.write(PartitionWriteRequest::new(10, vec![1, 2, 3])).unwrap().ok().unwrap();
        let (_, r) = poll_ready(PartitionIoFutureAsCoreFuture::new(&dev, write)).unwrap();
        r.unwrap();

        let request = PartitionReadRequest::new(8, Vec::new(), 8).unwrap();
        let read = dev.read(request).unwrap().ok().unwrap();
        let (request, n) = poll_ready(PartitionIoFutureAsCoreFuture::new(&dev, read)).unwrap();
        assert_eq!(n.unwrap(), 8);
        assert_eq!(request.data(), &[0xa5, 0xa5, 1, 2, 3, 0xa5, 0xa5, 0xa5]);

        // Short read at the end.
        let request = PartitionReadRequest::new(996, request.into_buffer(), 8).unwrap();
        let read = dev.read(request).unwrap().ok().unwrap();
        let (_, n) = poll_ready(PartitionIoFutureAsCoreFuture::new(&dev, read)).unwrap();
        assert_eq!(n.unwrap(), 4);

        let sync = dev.write_sync().unwrap();
        poll_ready(PartitionIoFutureAsCoreFuture::new(&dev, sync)).unwrap();
    }

    #[test]
    fn test_file_partition_device_read_only() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let path = image.path().to_str().unwrap().to_owned();

        let devices = FilePartitionDevices::new();
        // Regular files are not block devices, setting the flag is a nop.
        devices.set_read_only(&path, true).unwrap();
        let dev = devices.open(&path, false).unwrap();
        assert!(!dev.is_writable());
        match dev.write(PartitionWriteRequest::new(0, vec![0])).unwrap() {
            Ok(_) => panic!("write to read-only device accepted"),
            Err((_, e)) => assert_eq!(e, PartitionIoError::ReadOnly),
        }
    }

    #[test]
    fn test_file_partition_device_open_nonexistent() {
        let devices = FilePartitionDevices::new();
        assert_eq!(
            devices.open("/non-existent/partition", false).err(),
            Some(PartitionIoError::NotFound)
        );
    }
}
