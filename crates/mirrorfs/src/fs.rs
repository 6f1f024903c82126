//! The mirroring filesystem facade.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::{MirrorConfig, ResolvedBehavior};
use crate::error::{MirrorError, MirrorResult};
use crate::file::MirroredFile;
use crate::gc::{GarbageCollector, GcStats};
use crate::queue::{Mirror, OpQueue, Operation};
use crate::vfs::{DirEntry, FileAttr, LocalBackend, OpenFlags, SetAttr, VfsFile, VfsOps};
use crate::worker::Worker;

/// Name reported by [`MirrorFs::name`].
pub const NAME: &str = "mirrorfs";

/// Write-behind mirror of a destination backend.
///
/// Every call completes on the temporary backend first and returns that
/// result. Mutations are then queued and replayed on the destination by a
/// background worker, in call order. Reads only ever touch the temporary
/// backend. A periodic garbage collector evicts old files from the
/// temporary backend once the queue is idle.
///
/// Destination failures never reach the caller; they are logged.
pub struct MirrorFs {
    temporary: Arc<dyn VfsOps>,
    queue: OpQueue,
    behavior: ResolvedBehavior,
    timer: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MirrorFs {
    /// Build the filesystem and start its worker.
    ///
    /// Must be called from within a Tokio runtime. Without a configured
    /// temporary backend a private temporary directory is created, and
    /// removed again once the filesystem and its open files are gone.
    pub fn new(config: MirrorConfig) -> MirrorResult<Self> {
        let destination = config.destination.ok_or(MirrorError::NoDestination)?;
        let behavior = config.behavior.resolve()?;
        let temporary: Arc<dyn VfsOps> = match config.temporary {
            Some(temporary) => temporary,
            None => Arc::new(LocalBackend::temporary().map_err(MirrorError::Temporary)?),
        };

        let (queue, rx) = OpQueue::bounded(behavior.queue_capacity);
        let timer = CancellationToken::new();
        let worker = Worker::new(
            rx,
            queue.downgrade(),
            temporary.clone(),
            destination,
            GarbageCollector::new(temporary.clone(), &behavior),
            behavior.cleanup_period,
            timer.clone(),
        );
        let handle = tokio::spawn(worker.run().instrument(info_span!("mirrorfs")));

        debug!(?behavior, "mirror filesystem started");

        Ok(Self {
            temporary,
            queue,
            behavior,
            timer,
            worker: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Identifier of this filesystem layer.
    pub fn name(&self) -> &'static str {
        NAME
    }

    /// The behavior in effect.
    pub fn behavior(&self) -> &ResolvedBehavior {
        &self.behavior
    }

    /// The temporary backend. Changes made through it are not mirrored.
    pub fn temporary(&self) -> &Arc<dyn VfsOps> {
        &self.temporary
    }

    /// Operations queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Attributes from the temporary backend.
    pub async fn stat(&self, path: impl AsRef<Path>) -> MirrorResult<FileAttr> {
        self.temporary
            .getattr(path.as_ref())
            .await
            .map_err(MirrorError::Temporary)
    }

    /// Directory listing from the temporary backend.
    pub async fn read_dir(&self, path: impl AsRef<Path>) -> MirrorResult<Vec<DirEntry>> {
        self.temporary
            .readdir(path.as_ref())
            .await
            .map_err(MirrorError::Temporary)
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Open a file on the temporary backend.
    ///
    /// Writable handles are mirrored: their `sync`, `truncate` and `close`
    /// schedule a copy of the file to the destination. Read-only handles
    /// are returned as is.
    pub async fn open(
        &self,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        perm: u32,
    ) -> MirrorResult<Box<dyn VfsFile>> {
        let path = path.as_ref();
        if flags.is_writable() {
            self.check_open()?;
        }

        let file = self
            .temporary
            .open(path, flags, perm)
            .await
            .map_err(MirrorError::Temporary)?;

        if !flags.is_writable() {
            return Ok(file);
        }
        Ok(Box::new(MirroredFile::new(
            file,
            self.queue.downgrade(),
            path,
            flags,
            perm,
        )))
    }

    /// Open a file read-only. Never mirrored.
    pub async fn open_read(&self, path: impl AsRef<Path>) -> MirrorResult<Box<dyn VfsFile>> {
        self.open(path, OpenFlags::read(), 0).await
    }

    /// Create or truncate a file for writing.
    pub async fn create(&self, path: impl AsRef<Path>, perm: u32) -> MirrorResult<Box<dyn VfsFile>> {
        self.open(path, OpenFlags::create_truncate(), perm).await
    }

    // ========================================================================
    // Namespace and metadata
    // ========================================================================

    pub async fn mkdir(&self, path: impl AsRef<Path>, perm: u32) -> MirrorResult<()> {
        let path = path.as_ref();
        self.check_open()?;
        self.temporary
            .mkdir(path, perm)
            .await
            .map_err(MirrorError::Temporary)?;
        self.mirror(Mirror::Mkdir {
            path: path.to_path_buf(),
            perm,
        })
        .await
    }

    pub async fn mkdir_all(&self, path: impl AsRef<Path>, perm: u32) -> MirrorResult<()> {
        let path = path.as_ref();
        self.check_open()?;
        self.temporary
            .mkdir_all(path, perm)
            .await
            .map_err(MirrorError::Temporary)?;
        self.mirror(Mirror::MkdirAll {
            path: path.to_path_buf(),
            perm,
        })
        .await
    }

    /// Remove a file or an empty directory.
    pub async fn remove(&self, path: impl AsRef<Path>) -> MirrorResult<()> {
        let path = path.as_ref();
        self.check_open()?;
        self.temporary
            .remove(path)
            .await
            .map_err(MirrorError::Temporary)?;
        self.mirror(Mirror::Remove {
            path: path.to_path_buf(),
        })
        .await
    }

    /// Remove a path and everything below it.
    pub async fn remove_all(&self, path: impl AsRef<Path>) -> MirrorResult<()> {
        let path = path.as_ref();
        self.check_open()?;
        self.temporary
            .remove_all(path)
            .await
            .map_err(MirrorError::Temporary)?;
        self.mirror(Mirror::RemoveAll {
            path: path.to_path_buf(),
        })
        .await
    }

    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> MirrorResult<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        self.check_open()?;
        self.temporary
            .rename(from, to)
            .await
            .map_err(MirrorError::Temporary)?;
        self.mirror(Mirror::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        })
        .await
    }

    pub async fn chmod(&self, path: impl AsRef<Path>, perm: u32) -> MirrorResult<()> {
        self.setattr(path.as_ref(), SetAttr::new().with_perm(perm)).await
    }

    pub async fn chown(&self, path: impl AsRef<Path>, uid: u32, gid: u32) -> MirrorResult<()> {
        self.setattr(path.as_ref(), SetAttr::new().with_owner(uid, gid))
            .await
    }

    pub async fn chtimes(
        &self,
        path: impl AsRef<Path>,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> MirrorResult<()> {
        self.setattr(path.as_ref(), SetAttr::new().with_times(atime, mtime))
            .await
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> MirrorResult<()> {
        self.check_open()?;
        self.temporary
            .setattr(path, attr.clone())
            .await
            .map_err(MirrorError::Temporary)?;
        self.mirror(Mirror::SetAttr {
            path: path.to_path_buf(),
            attr,
        })
        .await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Wait until every operation queued before this call has run.
    pub async fn sync(&self) -> MirrorResult<()> {
        self.check_open()?;
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(Operation::Barrier(tx)).await?;
        rx.await.map_err(|_| MirrorError::Closed)
    }

    /// Queue a GC pass and wait for its counters.
    pub async fn collect_garbage(&self) -> MirrorResult<GcStats> {
        self.check_open()?;
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(Operation::Gc { reply: Some(tx) }).await?;
        rx.await.map_err(|_| MirrorError::Closed)?
    }

    /// Stop the cleanup timer, let queued operations finish and stop the worker.
    ///
    /// Closing twice is fine. Afterwards every mutation fails with
    /// [`MirrorError::Closed`]; open handles keep working on the temporary
    /// backend but are no longer mirrored.
    pub async fn close(&self) -> MirrorResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.timer.cancel();
        if self.queue.enqueue(Operation::Stop).await.is_err() {
            debug!("worker already gone");
        }

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "mirror worker ended abnormally");
            }
        }
        Ok(())
    }

    fn check_open(&self) -> MirrorResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MirrorError::Closed)
        } else {
            Ok(())
        }
    }

    async fn mirror(&self, op: Mirror) -> MirrorResult<()> {
        self.queue.enqueue(Operation::Mirror(op)).await
    }
}

impl Drop for MirrorFs {
    fn drop(&mut self) {
        // The worker drains what is queued and exits once the queue is gone.
        self.timer.cancel();
    }
}

impl std::fmt::Debug for MirrorFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorFs")
            .field("behavior", &self.behavior)
            .field("pending", &self.pending())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
