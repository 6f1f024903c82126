//! Backend operations traits.
//!
//! [`VfsOps`] is the path-based side of a backend (metadata, namespace
//! changes, opening files). [`VfsFile`] is one open handle with its own
//! cursor.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;

use super::types::{DirEntry, FileAttr, OpenFlags, SetAttr};
use super::VfsResult;

/// Core backend operations trait.
///
/// Paths are always relative to the backend's root; a leading `/` is
/// ignored. The empty path names the root directory.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Read directory entries.
    ///
    /// Returns all entries in the directory, in the backend's listing order.
    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>>;

    /// Open a file.
    ///
    /// `perm` is only used when `flags.create` creates the file. Creating a
    /// file also creates missing parent directories.
    async fn open(&self, path: &Path, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn VfsFile>>;

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Create a single directory. The parent must exist.
    async fn mkdir(&self, path: &Path, perm: u32) -> VfsResult<()>;

    /// Create a directory and any missing parents. Existing directories are fine.
    async fn mkdir_all(&self, path: &Path, perm: u32) -> VfsResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &Path) -> VfsResult<()>;

    /// Remove a path and everything below it. A missing path is not an error.
    async fn remove_all(&self, path: &Path) -> VfsResult<()>;

    /// Rename a file or directory.
    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()>;

    /// Set file attributes.
    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, path: &Path) -> bool {
        self.getattr(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        let mut file = self.open(path, OpenFlags::read(), 0).await?;
        let mut data = Vec::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        file.close().await?;
        Ok(data)
    }

    /// Write entire file contents, creating or truncating the file.
    async fn write_all(&self, path: &Path, data: &[u8], perm: u32) -> VfsResult<()> {
        let mut file = self.open(path, OpenFlags::create_truncate(), perm).await?;
        write_fully(file.as_mut(), data).await?;
        file.close().await
    }
}

/// One open file handle.
///
/// Handles keep their own cursor. Every operation after `close` fails with
/// [`VfsError::FileClosed`](super::VfsError::FileClosed).
#[async_trait]
pub trait VfsFile: Send {
    /// Path the handle was opened with.
    fn path(&self) -> &Path;

    /// Read into `buf` at the cursor. Returns 0 at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    /// Write `data` at the cursor (or at the end in append mode).
    async fn write(&mut self, data: &[u8]) -> VfsResult<usize>;

    /// Move the cursor. Returns the new absolute position.
    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64>;

    /// Truncate or extend the file to `size` bytes.
    async fn truncate(&mut self, size: u64) -> VfsResult<()>;

    /// Flush buffered data to the backend.
    async fn sync(&mut self) -> VfsResult<()>;

    /// Attributes of the open file.
    async fn stat(&mut self) -> VfsResult<FileAttr>;

    /// Release the handle.
    async fn close(&mut self) -> VfsResult<()>;
}

/// Chunk size used when streaming whole files.
pub const COPY_BUF_SIZE: usize = 64 * 1024;

/// Write all of `data`, looping over short writes.
pub async fn write_fully(file: &mut dyn VfsFile, mut data: &[u8]) -> VfsResult<()> {
    while !data.is_empty() {
        let n = file.write(data).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
    }
    Ok(())
}

/// Stream everything readable from `src` into `dst`. Returns the byte count.
pub async fn copy(src: &mut dyn VfsFile, dst: &mut dyn VfsFile) -> VfsResult<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        write_fully(dst, &buf[..n]).await?;
        total += n as u64;
    }
}
