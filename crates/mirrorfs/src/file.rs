//! Mirrored file handles and the copy-back they schedule.
//!
//! A [`MirroredFile`] wraps a writable handle on the temporary backend.
//! Reads and writes go straight to the temporary file; `sync`, `truncate`
//! and `close` additionally queue a copy of the whole file to the
//! destination. The copy reads the temporary file when the worker gets to
//! it, so it carries whatever the file holds at that point.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::queue::{Operation, WeakQueue};
use crate::vfs::{self, FileAttr, OpenFlags, VfsFile, VfsOps, VfsResult};

/// Writable handle whose changes are copied to the destination.
///
/// Holds only a weak reference to the operation queue: a handle that
/// outlives its filesystem keeps working on the temporary side, and its
/// copy-backs are dropped with a warning.
pub struct MirroredFile {
    inner: Box<dyn VfsFile>,
    queue: WeakQueue,
    path: PathBuf,
    flags: OpenFlags,
    perm: u32,
}

impl MirroredFile {
    pub(crate) fn new(
        inner: Box<dyn VfsFile>,
        queue: WeakQueue,
        path: &Path,
        flags: OpenFlags,
        perm: u32,
    ) -> Self {
        Self {
            inner,
            queue,
            path: path.to_path_buf(),
            flags,
            perm,
        }
    }

    /// Builds an owned copy-back request, so the enqueue future holds
    /// nothing borrowed from the handle.
    fn copy_request(&self) -> CopyRequest {
        CopyRequest {
            queue: self.queue.clone(),
            path: self.path.clone(),
            flags: self.flags,
            perm: self.perm,
        }
    }
}

struct CopyRequest {
    queue: WeakQueue,
    path: PathBuf,
    flags: OpenFlags,
    perm: u32,
}

impl CopyRequest {
    async fn send(self) {
        let op = Operation::CopyBack {
            path: self.path.clone(),
            flags: self.flags,
            perm: self.perm,
        };
        if let Err(e) = self.queue.enqueue(op).await {
            warn!(path = %self.path.display(), error = %e, "couldn't schedule copy-back");
        }
    }
}

#[async_trait]
impl VfsFile for MirroredFile {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.inner.read(buf).await
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.inner.write(data).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.inner.seek(pos).await
    }

    /// Queues the copy-back before truncating. The copy still runs after
    /// the truncation, since the worker reads the file when it gets there.
    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        let request = self.copy_request();
        request.send().await;
        self.inner.truncate(size).await
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.inner.sync().await?;
        let request = self.copy_request();
        request.send().await;
        Ok(())
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.inner.stat().await
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.inner.close().await?;
        if self.flags.is_writable() {
            let request = self.copy_request();
            request.send().await;
        }
        Ok(())
    }
}

/// Copy the temporary file at `path` over the destination file.
///
/// The destination is created if missing and truncated first, so it ends
/// up byte-identical to the temporary file. Open and copy errors are
/// logged here with the open flags and permissions of the handle that
/// scheduled the copy. Close errors on either side are only logged.
pub(crate) async fn copy_back(
    temporary: &dyn VfsOps,
    destination: &dyn VfsOps,
    path: &Path,
    flags: OpenFlags,
    perm: u32,
) -> MirrorResult<u64> {
    debug!(path = %path.display(), "copying file to destination");

    let mut src = match temporary.open(path, OpenFlags::read(), 0).await {
        Ok(src) => src,
        Err(e) => {
            error!(path = %path.display(), ?flags, perm = format_args!("{perm:o}"), error = %e, "couldn't open temporary file");
            return Err(MirrorError::Temporary(e));
        }
    };

    let mut dst = match destination.open(path, OpenFlags::create_truncate(), perm).await {
        Ok(dst) => dst,
        Err(e) => {
            error!(path = %path.display(), ?flags, perm = format_args!("{perm:o}"), error = %e, "couldn't open destination file");
            close_quietly(src.as_mut(), "temporary").await;
            return Err(MirrorError::Destination(e));
        }
    };

    let copied = vfs::copy(src.as_mut(), dst.as_mut()).await;
    close_quietly(src.as_mut(), "temporary").await;
    close_quietly(dst.as_mut(), "destination").await;

    match copied {
        Ok(bytes) => {
            debug!(path = %path.display(), bytes, "copy done");
            Ok(bytes)
        }
        Err(e) => {
            error!(path = %path.display(), ?flags, perm = format_args!("{perm:o}"), error = %e, "couldn't copy file");
            Err(MirrorError::Destination(e))
        }
    }
}

async fn close_quietly(file: &mut dyn VfsFile, side: &str) {
    if let Err(e) = file.close().await {
        warn!(path = %file.path().display(), side, error = %e, "couldn't close file");
    }
}
