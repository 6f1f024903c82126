//! Operation queue.
//!
//! Every destination mutation, every GC pass and every barrier goes through
//! one bounded FIFO drained by a single worker. Producers wait when the
//! queue is full, so a slow destination slows writers down instead of
//! growing memory.

use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::error::{MirrorError, MirrorResult};
use crate::gc::GcStats;
use crate::vfs::{OpenFlags, SetAttr};

/// A namespace or metadata change replayed on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mirror {
    Mkdir { path: PathBuf, perm: u32 },
    MkdirAll { path: PathBuf, perm: u32 },
    Remove { path: PathBuf },
    RemoveAll { path: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    SetAttr { path: PathBuf, attr: SetAttr },
}

/// Work item for the worker.
#[derive(Debug)]
pub(crate) enum Operation {
    /// Replay a facade mutation on the destination.
    Mirror(Mirror),
    /// Copy the whole temporary file to the destination.
    CopyBack {
        path: PathBuf,
        flags: OpenFlags,
        perm: u32,
    },
    /// Run one GC pass over the temporary backend.
    Gc {
        reply: Option<oneshot::Sender<MirrorResult<GcStats>>>,
    },
    /// Signal once everything queued before it has run.
    Barrier(oneshot::Sender<()>),
    /// Stop the worker.
    Stop,
}

impl Operation {
    /// Short name for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Operation::Mirror(_) => "mirror",
            Operation::CopyBack { .. } => "copy_back",
            Operation::Gc { .. } => "gc",
            Operation::Barrier(_) => "barrier",
            Operation::Stop => "stop",
        }
    }
}

/// An operation with the time it entered the queue.
#[derive(Debug)]
pub(crate) struct QueuedOperation {
    pub(crate) op: Operation,
    pub(crate) queued_at: Instant,
}

impl QueuedOperation {
    fn new(op: Operation) -> Self {
        Self {
            op,
            queued_at: Instant::now(),
        }
    }
}

/// Owning producer side of the queue.
///
/// The worker exits once every `OpQueue` is gone, so only the facade holds
/// one; everything else gets a [`WeakQueue`].
#[derive(Debug, Clone)]
pub(crate) struct OpQueue {
    tx: mpsc::Sender<QueuedOperation>,
}

impl OpQueue {
    /// Create a queue holding at most `capacity` operations.
    pub(crate) fn bounded(capacity: usize) -> (Self, mpsc::Receiver<QueuedOperation>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Append an operation, waiting while the queue is full.
    pub(crate) async fn enqueue(&self, op: Operation) -> MirrorResult<()> {
        self.tx
            .send(QueuedOperation::new(op))
            .await
            .map_err(|_| MirrorError::Closed)
    }

    /// Number of operations waiting to be picked up by the worker.
    pub(crate) fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Non-owning handle on the same queue.
    pub(crate) fn downgrade(&self) -> WeakQueue {
        WeakQueue {
            tx: self.tx.downgrade(),
        }
    }
}

/// Producer handle that does not keep the queue alive.
#[derive(Debug, Clone)]
pub(crate) struct WeakQueue {
    tx: mpsc::WeakSender<QueuedOperation>,
}

impl WeakQueue {
    /// Append an operation, waiting while the queue is full.
    ///
    /// Fails with [`MirrorError::Closed`] once the owning queue is gone.
    pub(crate) async fn enqueue(&self, op: Operation) -> MirrorResult<()> {
        let tx = self.tx.upgrade().ok_or(MirrorError::Closed)?;
        tx.send(QueuedOperation::new(op))
            .await
            .map_err(|_| MirrorError::Closed)
    }

    /// Append an operation only if there is room right now.
    pub(crate) fn try_enqueue(&self, op: Operation) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.try_send(QueuedOperation::new(op)).is_ok(),
            None => false,
        }
    }
}
