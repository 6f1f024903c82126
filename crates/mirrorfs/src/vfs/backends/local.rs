//! Local filesystem backend.
//!
//! Provides access to real filesystem paths, with path security
//! to prevent escaping the root directory.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{VfsFile, VfsOps};
use crate::vfs::types::{DirEntry, FileAttr, FileType, OpenFlags, SetAttr};

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/var/spool/uploads`, then `open("a/b.bin")` opens
/// `/var/spool/uploads/a/b.bin`.
///
/// Path security is enforced: attempts to escape via `..` are blocked.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    /// Private directory owned by this backend, removed with the last clone.
    scratch: Option<Arc<TempDir>>,
}

impl LocalBackend {
    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            scratch: None,
        }
    }

    /// Create a backend over a fresh private temporary directory.
    ///
    /// The directory is deleted when the last clone of the backend is dropped.
    pub fn temporary() -> VfsResult<Self> {
        let dir = tempfile::Builder::new().prefix("mirrorfs-").tempdir()?;
        let mut backend = Self::new(dir.path());
        backend.scratch = Some(Arc::new(dir));
        Ok(backend)
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Returns an error if the path escapes the root (via `..`).
    async fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        // Strip leading slash if present
        let path = path.strip_prefix("/").unwrap_or(path);

        // Handle empty path (root)
        if path.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(path);

        // Canonicalize to resolve symlinks and ..
        // For non-existent paths, we need to check parent
        let canonical = if full.exists() {
            full.canonicalize()?
        } else {
            let parent = full.parent().ok_or_else(|| VfsError::invalid_path("no parent"))?;

            let filename = full
                .file_name()
                .ok_or_else(|| VfsError::invalid_path("no filename"))?;

            if parent.exists() {
                parent.canonicalize()?.join(filename)
            } else if path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(VfsError::path_escapes_root(path.display().to_string()));
            } else {
                // Parent doesn't exist, will fail on actual operation
                full
            }
        };

        if !canonical.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }

        Ok(canonical)
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        FileAttr {
            size: meta.len(),
            kind,
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }
    }
}

#[async_trait]
impl VfsOps for LocalBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path).await?;
        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let full_path = self.resolve(path).await?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };

            entries.push(DirEntry::new(entry.file_name().to_string_lossy(), kind));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open(&self, path: &Path, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn VfsFile>> {
        let full_path = self.resolve(path).await?;

        if flags.create {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut options = fs::OpenOptions::new();
        options
            .read(flags.read)
            .write(flags.write && !flags.append)
            .append(flags.append)
            .truncate(flags.truncate && flags.is_writable())
            .mode(perm);
        if flags.create && flags.exclusive {
            options.create_new(true);
        } else {
            options.create(flags.create);
        }

        let file = options.open(&full_path).await?;
        Ok(Box::new(LocalFile {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    async fn mkdir(&self, path: &Path, perm: u32) -> VfsResult<()> {
        let full_path = self.resolve(path).await?;
        fs::DirBuilder::new().mode(perm).create(&full_path).await?;
        Ok(())
    }

    async fn mkdir_all(&self, path: &Path, perm: u32) -> VfsResult<()> {
        let full_path = self.resolve(path).await?;
        fs::DirBuilder::new()
            .mode(perm)
            .recursive(true)
            .create(&full_path)
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        let full_path = self.resolve(path).await?;
        if full_path == self.root {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let meta = fs::symlink_metadata(&full_path).await?;
        if meta.is_dir() {
            fs::remove_dir(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let full_path = self.resolve(path).await?;

        if full_path == self.root {
            let mut dir = fs::read_dir(&full_path).await?;
            while let Some(entry) = dir.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(entry.path()).await?;
                } else {
                    fs::remove_file(entry.path()).await?;
                }
            }
            return Ok(());
        }

        let meta = match fs::symlink_metadata(&full_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from_path = self.resolve(from).await?;
        let to_path = self.resolve(to).await?;
        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path).await?;

        if let Some(perm) = attr.perm {
            let permissions = std::fs::Permissions::from_mode(perm);
            fs::set_permissions(&full_path, permissions).await?;
        }

        let owner = attr.uid.is_some() || attr.gid.is_some();
        let times = attr.mtime.is_some() || attr.atime.is_some();
        if owner || times {
            tokio::task::spawn_blocking(move || set_owner_and_times(&full_path, &attr))
                .await
                .map_err(|e| VfsError::other(format!("setattr task failed: {e}")))??;
        }

        self.getattr(path).await
    }
}

/// Blocking half of `setattr`: ownership and timestamps.
fn set_owner_and_times(path: &Path, attr: &SetAttr) -> std::io::Result<()> {
    if attr.uid.is_some() || attr.gid.is_some() {
        std::os::unix::fs::chown(path, attr.uid, attr.gid)?;
    }

    if attr.mtime.is_some() || attr.atime.is_some() {
        let mut times = std::fs::FileTimes::new();
        if let Some(atime) = attr.atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = attr.mtime {
            times = times.set_modified(mtime);
        }
        // Any descriptor will do; write-only files can't be opened for reading.
        let file = match std::fs::File::open(path) {
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                std::fs::OpenOptions::new().write(true).open(path)?
            }
            opened => opened?,
        };
        file.set_times(times)?;
    }

    Ok(())
}

/// Open handle on a [`LocalBackend`] file.
#[derive(Debug)]
struct LocalFile {
    path: PathBuf,
    file: Option<fs::File>,
}

impl LocalFile {
    fn file(&mut self) -> VfsResult<&mut fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| VfsError::file_closed(self.path.display().to_string()))
    }
}

#[async_trait]
impl VfsFile for LocalFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        Ok(self.file()?.read(buf).await?)
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        Ok(self.file()?.write(data).await?)
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        Ok(self.file()?.seek(pos).await?)
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        Ok(self.file()?.set_len(size).await?)
    }

    async fn sync(&mut self) -> VfsResult<()> {
        let file = self.file()?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        let meta = self.file()?.metadata().await?;
        Ok(LocalBackend::metadata_to_attr(&meta))
    }

    async fn close(&mut self) -> VfsResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| VfsError::file_closed(self.path.display().to_string()))?;
        // tokio finishes in-flight writes in the background; flush so they
        // are visible to the next open.
        file.flush().await?;
        Ok(())
    }
}
