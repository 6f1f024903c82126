//! Core backend types.
//!
//! Path-based metadata shared by every backend, plus the open flags that
//! decide whether a handle gets mirrored.

use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permissions (e.g., 0o644).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last access time (optional).
    pub atime: Option<SystemTime>,
    /// User ID (optional, for local fs).
    pub uid: Option<u32>,
    /// Group ID (optional, for local fs).
    pub gid: Option<u32>,
}

impl FileAttr {
    /// Create attributes for a new file.
    pub fn file(size: u64, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size,
            kind: FileType::File,
            perm,
            mtime: now,
            atime: Some(now),
            uid: None,
            gid: None,
        }
    }

    /// Create attributes for a new directory.
    pub fn directory(perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: now,
            atime: Some(now),
            uid: None,
            gid: None,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Attributes to set (chmod, chown and chtimes all go through this).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    /// New modification time.
    pub mtime: Option<SystemTime>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New permissions.
    pub perm: Option<u32>,
    /// New user ID.
    pub uid: Option<u32>,
    /// New group ID.
    pub gid: Option<u32>,
}

impl SetAttr {
    /// Create a new empty SetAttr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the access and modification times.
    pub fn with_times(mut self, atime: SystemTime, mtime: SystemTime) -> Self {
        self.atime = Some(atime);
        self.mtime = Some(mtime);
        self
    }

    /// Set permissions.
    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Set the owning user and group.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Write-only access, no read.
    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            ..Default::default()
        }
    }

    /// Append to the end of the file, creating it if needed.
    pub fn append() -> Self {
        Self {
            read: false,
            write: true,
            append: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Returns true if a handle opened with these flags can modify the file.
    pub fn is_writable(&self) -> bool {
        self.write || self.append
    }
}
