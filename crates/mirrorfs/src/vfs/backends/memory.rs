//! In-memory filesystem backend.
//!
//! Used for tests and as a throwaway destination. All data is ephemeral.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{VfsFile, VfsOps};
use crate::vfs::types::{DirEntry, FileAttr, FileType, OpenFlags, SetAttr};

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> &FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
        }
    }

    fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }
}

type EntryMap = HashMap<PathBuf, Entry>;

/// Entry table shared between the backend and its open handles.
#[derive(Debug, Clone)]
struct Entries(Arc<RwLock<EntryMap>>);

impl Entries {
    fn read(&self) -> VfsResult<RwLockReadGuard<'_, EntryMap>> {
        self.0.read().map_err(|_| VfsError::other("lock poisoned"))
    }

    fn write(&self) -> VfsResult<RwLockWriteGuard<'_, EntryMap>> {
        self.0.write().map_err(|_| VfsError::other("lock poisoned"))
    }
}

/// In-memory filesystem backend.
///
/// Thread-safe via internal `RwLock`. All data is lost when dropped.
/// Directory listings are sorted by name.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Entries,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            PathBuf::new(),
            Entry::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Self {
            entries: Entries(Arc::new(RwLock::new(entries))),
        }
    }

    /// Normalize a path: remove leading `/`, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => {
                    result.push(s);
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        result
    }

    /// Get the path string for error messages.
    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    /// Parent of a normalized, non-root path.
    fn parent_of(path: &Path) -> PathBuf {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    /// Create every missing ancestor of `path` as a directory.
    fn ensure_parents(entries: &mut EntryMap, path: &Path) -> VfsResult<()> {
        let mut current = PathBuf::new();
        for component in Self::parent_of(path).components() {
            if let Component::Normal(s) = component {
                current.push(s);
                match entries.get(&current) {
                    Some(Entry::Directory { .. }) => {}
                    Some(Entry::File { .. }) => {
                        return Err(VfsError::not_a_directory(Self::path_str(&current)));
                    }
                    None => {
                        entries.insert(
                            current.clone(),
                            Entry::Directory {
                                attr: FileAttr::directory(0o755),
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Fail unless the parent of `path` exists and is a directory.
    fn check_parent(entries: &EntryMap, path: &Path) -> VfsResult<()> {
        let parent = Self::parent_of(path);
        match entries.get(&parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(VfsError::not_a_directory(Self::path_str(&parent))),
            None => Err(VfsError::not_found(Self::path_str(&parent))),
        }
    }

    fn has_children(entries: &EntryMap, path: &Path) -> bool {
        entries
            .keys()
            .any(|k| k.parent() == Some(path) && k.as_path() != path)
    }
}

#[async_trait]
impl VfsOps for MemoryBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read()?;

        entries
            .get(&normalized)
            .map(|e| e.attr().clone())
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read()?;

        // Verify the path is a directory
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => {
                return Err(VfsError::not_a_directory(Self::path_str(&normalized)));
            }
            None => {
                return Err(VfsError::not_found(Self::path_str(&normalized)));
            }
        }

        let mut result = Vec::new();
        for (entry_path, entry) in entries.iter() {
            if entry_path.parent() == Some(normalized.as_path()) && entry_path != &normalized {
                if let Some(name) = entry_path.file_name() {
                    let kind = if entry.is_dir() {
                        FileType::Directory
                    } else {
                        FileType::File
                    };
                    result.push(DirEntry::new(name.to_string_lossy(), kind));
                }
            }
        }

        // Sort for consistent ordering
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn open(&self, path: &Path, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn VfsFile>> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write()?;

        match entries.get_mut(&normalized) {
            Some(Entry::Directory { .. }) => {
                return Err(VfsError::is_a_directory(Self::path_str(&normalized)));
            }
            Some(Entry::File { data, attr }) => {
                if flags.create && flags.exclusive {
                    return Err(VfsError::already_exists(Self::path_str(&normalized)));
                }
                if flags.truncate && flags.is_writable() {
                    data.clear();
                    attr.size = 0;
                    attr.mtime = SystemTime::now();
                }
            }
            None if flags.create => {
                Self::ensure_parents(&mut entries, &normalized)?;
                entries.insert(
                    normalized.clone(),
                    Entry::File {
                        data: Vec::new(),
                        attr: FileAttr::file(0, perm),
                    },
                );
            }
            None => return Err(VfsError::not_found(Self::path_str(&normalized))),
        }

        Ok(Box::new(MemoryFile {
            entries: self.entries.clone(),
            display: path.to_path_buf(),
            path: normalized,
            flags,
            pos: 0,
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &Path, perm: u32) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write()?;

        if entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(Self::path_str(&normalized)));
        }
        Self::check_parent(&entries, &normalized)?;

        entries.insert(
            normalized,
            Entry::Directory {
                attr: FileAttr::directory(perm),
            },
        );
        Ok(())
    }

    async fn mkdir_all(&self, path: &Path, perm: u32) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write()?;

        let mut current = PathBuf::new();
        for component in normalized.components() {
            current.push(component);
            match entries.get(&current) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(VfsError::not_a_directory(Self::path_str(&current)));
                }
                None => {
                    entries.insert(
                        current.clone(),
                        Entry::Directory {
                            attr: FileAttr::directory(perm),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);

        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut entries = self.entries.write()?;

        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) if Self::has_children(&entries, &normalized) => {
                Err(VfsError::directory_not_empty(Self::path_str(&normalized)))
            }
            Some(_) => {
                entries.remove(&normalized);
                Ok(())
            }
            None => Err(VfsError::not_found(Self::path_str(&normalized))),
        }
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write()?;

        // The root itself survives; everything at or below `path` goes.
        entries.retain(|k, _| k.as_os_str().is_empty() || !k.starts_with(&normalized));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from_normalized = Self::normalize(from);
        let to_normalized = Self::normalize(to);

        if from_normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot rename root"));
        }

        let mut entries = self.entries.write()?;

        let source_is_dir = match entries.get(&from_normalized) {
            Some(entry) => entry.is_dir(),
            None => return Err(VfsError::not_found(Self::path_str(&from_normalized))),
        };
        if from_normalized == to_normalized {
            return Ok(());
        }
        if to_normalized.starts_with(&from_normalized) {
            return Err(VfsError::invalid_path(format!(
                "cannot move {} into itself",
                Self::path_str(&from_normalized)
            )));
        }
        Self::check_parent(&entries, &to_normalized)?;

        match entries.get(&to_normalized) {
            Some(Entry::Directory { .. }) if !source_is_dir => {
                return Err(VfsError::is_a_directory(Self::path_str(&to_normalized)));
            }
            Some(Entry::Directory { .. }) if Self::has_children(&entries, &to_normalized) => {
                return Err(VfsError::directory_not_empty(Self::path_str(&to_normalized)));
            }
            Some(Entry::File { .. }) if source_is_dir => {
                return Err(VfsError::not_a_directory(Self::path_str(&to_normalized)));
            }
            _ => {}
        }

        let Some(entry) = entries.remove(&from_normalized) else {
            return Err(VfsError::not_found(Self::path_str(&from_normalized)));
        };

        // If it's a directory, we need to rename all children too
        if source_is_dir {
            let children: Vec<_> = entries
                .keys()
                .filter(|k| k.starts_with(&from_normalized))
                .cloned()
                .collect();

            for child in children {
                if let Some(child_entry) = entries.remove(&child) {
                    if let Ok(relative) = child.strip_prefix(&from_normalized) {
                        entries.insert(to_normalized.join(relative), child_entry);
                    }
                }
            }
        }

        // Insert at new location (possibly overwriting)
        entries.insert(to_normalized, entry);
        Ok(())
    }

    async fn setattr(&self, path: &Path, set: SetAttr) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write()?;

        let entry = entries
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))?;

        let attr = entry.attr_mut();
        if let Some(mtime) = set.mtime {
            attr.mtime = mtime;
        }
        if let Some(atime) = set.atime {
            attr.atime = Some(atime);
        }
        if let Some(perm) = set.perm {
            attr.perm = perm;
        }
        if let Some(uid) = set.uid {
            attr.uid = Some(uid);
        }
        if let Some(gid) = set.gid {
            attr.gid = Some(gid);
        }

        Ok(entry.attr().clone())
    }
}

/// Open handle on a [`MemoryBackend`] file.
///
/// The handle addresses its file by path, so renaming or removing the file
/// while it is open makes later operations fail with `NotFound`.
#[derive(Debug)]
struct MemoryFile {
    entries: Entries,
    display: PathBuf,
    path: PathBuf,
    flags: OpenFlags,
    pos: u64,
    closed: bool,
}

impl MemoryFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::file_closed(self.display.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> VfsResult<()> {
        self.check_open()?;
        if self.flags.is_writable() {
            Ok(())
        } else {
            Err(VfsError::bad_descriptor(self.display.display().to_string()))
        }
    }

    fn missing(&self) -> VfsError {
        VfsError::not_found(self.display.display().to_string())
    }
}

#[async_trait]
impl VfsFile for MemoryFile {
    fn path(&self) -> &Path {
        &self.display
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_open()?;
        if !self.flags.read {
            return Err(VfsError::bad_descriptor(self.display.display().to_string()));
        }

        let entries = self.entries.read()?;
        let Some(Entry::File { data, .. }) = entries.get(&self.path) else {
            return Err(self.missing());
        };

        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(entries);

        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.check_writable()?;

        let mut entries = self.entries.write()?;
        let Some(Entry::File { data, attr }) = entries.get_mut(&self.path) else {
            return Err(self.missing());
        };

        let offset = if self.flags.append {
            data.len()
        } else {
            self.pos as usize
        };
        // Extend if necessary
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        attr.size = data.len() as u64;
        attr.mtime = SystemTime::now();
        drop(entries);

        self.pos = (offset + buf.len()) as u64;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.check_open()?;

        let len = {
            let entries = self.entries.read()?;
            match entries.get(&self.path) {
                Some(entry) => entry.attr().size,
                None => return Err(self.missing()),
            }
        };

        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            VfsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ))
        })?;

        self.pos = target;
        Ok(target)
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.check_writable()?;

        let mut entries = self.entries.write()?;
        let Some(Entry::File { data, attr }) = entries.get_mut(&self.path) else {
            return Err(self.missing());
        };
        data.resize(size as usize, 0);
        attr.size = size;
        attr.mtime = SystemTime::now();
        Ok(())
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.check_open()
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.check_open()?;
        let entries = self.entries.read()?;
        entries
            .get(&self.path)
            .map(|e| e.attr().clone())
            .ok_or_else(|| self.missing())
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(fs: &MemoryBackend, path: &str, data: &[u8]) {
        fs.write_all(Path::new(path), data, 0o644).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let fs = MemoryBackend::new();
        write_file(&fs, "test.txt", b"hello world").await;

        let data = fs.read_all(Path::new("test.txt")).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_partial_read_after_seek() {
        let fs = MemoryBackend::new();
        write_file(&fs, "test.txt", b"hello world").await;

        let mut file = fs
            .open(Path::new("test.txt"), OpenFlags::read(), 0)
            .await
            .unwrap();
        assert_eq!(file.seek(SeekFrom::Start(6)).await.unwrap(), 6);

        let mut buf = [0u8; 5];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(file.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_mode() {
        let fs = MemoryBackend::new();
        write_file(&fs, "log", b"one\n").await;

        let mut file = fs
            .open(Path::new("log"), OpenFlags::append(), 0o644)
            .await
            .unwrap();
        file.write(b"two\n").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(fs.read_all(Path::new("log")).await.unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_read_only_handle_rejects_write() {
        let fs = MemoryBackend::new();
        write_file(&fs, "ro", b"data").await;

        let mut file = fs
            .open(Path::new("ro"), OpenFlags::read(), 0)
            .await
            .unwrap();
        assert!(matches!(
            file.write(b"x").await,
            Err(VfsError::BadDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let fs = MemoryBackend::new();
        let mut file = fs
            .open(Path::new("f"), OpenFlags::create(), 0o644)
            .await
            .unwrap();
        file.close().await.unwrap();

        assert!(matches!(file.close().await, Err(VfsError::FileClosed(_))));
        assert!(matches!(file.write(b"x").await, Err(VfsError::FileClosed(_))));
    }

    #[tokio::test]
    async fn test_exclusive_create() {
        let fs = MemoryBackend::new();
        write_file(&fs, "f", b"").await;

        let result = fs
            .open(Path::new("f"), OpenFlags::create_exclusive(), 0o644)
            .await;
        assert!(matches!(result, Err(VfsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent() {
        let fs = MemoryBackend::new();
        assert!(fs.mkdir(Path::new("a/b"), 0o755).await.unwrap_err().is_not_found());

        fs.mkdir(Path::new("a"), 0o755).await.unwrap();
        fs.mkdir(Path::new("a/b"), 0o755).await.unwrap();
        assert!(matches!(
            fs.mkdir(Path::new("a"), 0o755).await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir_all_and_readdir() {
        let fs = MemoryBackend::new();
        fs.mkdir_all(Path::new("/a/b/c"), 0o750).await.unwrap();
        fs.mkdir_all(Path::new("/a/b/c"), 0o750).await.unwrap();
        write_file(&fs, "a/file.txt", b"x").await;

        let entries = fs.readdir(Path::new("a")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "file.txt"]);
        assert!(entries[0].kind.is_dir());
        assert!(entries[1].kind.is_file());
        assert_eq!(fs.getattr(Path::new("a/b/c")).await.unwrap().perm, 0o750);
    }

    #[tokio::test]
    async fn test_remove() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("nonempty"), 0o755).await.unwrap();
        write_file(&fs, "nonempty/file.txt", b"x").await;

        assert!(matches!(
            fs.remove(Path::new("nonempty")).await,
            Err(VfsError::DirectoryNotEmpty(_))
        ));

        fs.remove(Path::new("nonempty/file.txt")).await.unwrap();
        fs.remove(Path::new("nonempty")).await.unwrap();
        assert!(!fs.exists(Path::new("nonempty")).await);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let fs = MemoryBackend::new();
        write_file(&fs, "a/b/c/file", b"x").await;
        write_file(&fs, "ab", b"sibling with shared prefix").await;

        fs.remove_all(Path::new("a")).await.unwrap();
        fs.remove_all(Path::new("missing")).await.unwrap();

        assert!(!fs.exists(Path::new("a")).await);
        assert!(!fs.exists(Path::new("a/b/c/file")).await);
        assert!(fs.exists(Path::new("ab")).await);
    }

    #[tokio::test]
    async fn test_rename_directory_moves_children() {
        let fs = MemoryBackend::new();
        write_file(&fs, "old/inner/file", b"content").await;

        fs.rename(Path::new("old"), Path::new("new")).await.unwrap();

        assert!(!fs.exists(Path::new("old")).await);
        assert_eq!(
            fs.read_all(Path::new("new/inner/file")).await.unwrap(),
            b"content"
        );
    }

    #[tokio::test]
    async fn test_rename_missing_source() {
        let fs = MemoryBackend::new();
        let err = fs
            .rename(Path::new("nope"), Path::new("other"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_truncate_through_handle() {
        let fs = MemoryBackend::new();
        write_file(&fs, "test.txt", b"hello world").await;

        let mut file = fs
            .open(Path::new("test.txt"), OpenFlags::write(), 0)
            .await
            .unwrap();
        file.truncate(5).await.unwrap();
        assert_eq!(file.stat().await.unwrap().size, 5);
        file.close().await.unwrap();

        assert_eq!(fs.read_all(Path::new("test.txt")).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_setattr() {
        let fs = MemoryBackend::new();
        write_file(&fs, "f", b"x").await;

        let epoch = SystemTime::UNIX_EPOCH;
        let attr = fs
            .setattr(
                Path::new("f"),
                SetAttr::new().with_perm(0o600).with_owner(7, 8).with_times(epoch, epoch),
            )
            .await
            .unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.uid, Some(7));
        assert_eq!(attr.gid, Some(8));
        assert_eq!(attr.mtime, epoch);
    }

    #[tokio::test]
    async fn test_auto_create_parents() {
        let fs = MemoryBackend::new();
        write_file(&fs, "a/b/c/file.txt", b"").await;

        assert!(fs.getattr(Path::new("a")).await.unwrap().is_dir());
        assert!(fs.getattr(Path::new("a/b")).await.unwrap().is_dir());
        assert!(fs.getattr(Path::new("a/b/c")).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_path_normalization() {
        let fs = MemoryBackend::new();
        write_file(&fs, "/a/b/c.txt", b"").await;

        // Various path forms should all work
        assert!(fs.getattr(Path::new("a/b/c.txt")).await.is_ok());
        assert!(fs.getattr(Path::new("/a/b/c.txt")).await.is_ok());
        assert!(fs.getattr(Path::new("a/./b/c.txt")).await.is_ok());
        assert!(fs.getattr(Path::new("a/b/../b/c.txt")).await.is_ok());
    }
}
