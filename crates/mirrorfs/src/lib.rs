//! # mirrorfs
//!
//! Write-behind mirroring filesystem layer.
//!
//! A [`MirrorFs`] sits in front of a durable destination backend:
//! - Every call runs against a fast temporary backend and returns at once
//! - Mutations are replayed on the destination by one background worker,
//!   in call order, through a bounded queue that holds producers back when
//!   the destination falls behind
//! - Writable files are copied whole to the destination on sync, truncate
//!   and close
//! - A periodic garbage collector keeps the temporary backend small,
//!   retaining recent files by count and age
//!
//! ```no_run
//! use std::sync::Arc;
//! use mirrorfs::{LocalBackend, MirrorConfig, MirrorFs, vfs::write_fully};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let dest = Arc::new(LocalBackend::new("/srv/archive"));
//! let fs = MirrorFs::new(MirrorConfig::new(dest))?;
//!
//! fs.mkdir_all("reports/2024", 0o755).await?;
//! let mut file = fs.create("reports/2024/q1.csv", 0o644).await?;
//! write_fully(file.as_mut(), b"id,total\n").await?;
//! file.close().await?;
//!
//! fs.sync().await?;
//! fs.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod file;
pub mod fs;
pub mod gc;
mod queue;
pub mod vfs;
mod worker;

pub use config::{Behavior, MirrorConfig, ResolvedBehavior};
pub use error::{MirrorError, MirrorResult};
pub use file::MirroredFile;
pub use fs::MirrorFs;
pub use gc::GcStats;
pub use vfs::{
    backends::{LocalBackend, MemoryBackend},
    DirEntry, FileAttr, FileType, OpenFlags, SetAttr, VfsError, VfsFile, VfsOps, VfsResult,
};
