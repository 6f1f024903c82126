//! Storage backend abstraction.
//!
//! Both sides of the mirror (the fast temporary area and the durable
//! destination) are reached through the same contract:
//!
//! - [`VfsOps`] - path-based operations (stat, listing, namespace changes, open)
//! - [`VfsFile`] - one open handle with its own cursor
//! - [`MemoryBackend`] - in-memory filesystem (tests, throwaway destinations)
//! - [`LocalBackend`] - local filesystem access rooted at a directory
//!
//! Paths are relative to the backend root; a leading `/` is ignored.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use ops::{COPY_BUF_SIZE, VfsFile, VfsOps, copy, write_fully};
pub use types::{DirEntry, FileAttr, FileType, OpenFlags, SetAttr};
