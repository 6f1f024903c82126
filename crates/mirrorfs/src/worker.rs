//! The single consumer of the operation queue.
//!
//! Runs every queued operation against the destination one at a time, in
//! enqueue order. Destination failures are logged and dropped; the caller
//! already saw the temporary side succeed. The cleanup timer lives here too
//! and only asks for a GC pass while the queue is idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::file::copy_back;
use crate::gc::GarbageCollector;
use crate::queue::{Mirror, Operation, QueuedOperation, WeakQueue};
use crate::vfs::VfsOps;

pub(crate) struct Worker {
    rx: mpsc::Receiver<QueuedOperation>,
    queue: WeakQueue,
    temporary: Arc<dyn VfsOps>,
    destination: Arc<dyn VfsOps>,
    gc: GarbageCollector,
    cleanup_period: Duration,
    timer: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        rx: mpsc::Receiver<QueuedOperation>,
        queue: WeakQueue,
        temporary: Arc<dyn VfsOps>,
        destination: Arc<dyn VfsOps>,
        gc: GarbageCollector,
        cleanup_period: Duration,
        timer: CancellationToken,
    ) -> Self {
        Self {
            rx,
            queue,
            temporary,
            destination,
            gc,
            cleanup_period,
            timer,
        }
    }

    /// Drain the queue until a stop request or until every producer is gone.
    pub(crate) async fn run(mut self) {
        let period = self.cleanup_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timer = self.timer.clone();
        let mut timer_running = true;

        info!(cleanup_period = ?period, "mirror worker started");

        loop {
            tokio::select! {
                queued = self.rx.recv() => {
                    let Some(queued) = queued else {
                        debug!("all queue handles dropped");
                        break;
                    };
                    if !self.execute(queued).await {
                        break;
                    }
                }
                _ = timer.cancelled(), if timer_running => {
                    debug!("cleanup timer stopped");
                    timer_running = false;
                }
                _ = ticker.tick(), if timer_running => self.on_tick(),
            }
        }

        info!("mirror worker stopped");
    }

    fn on_tick(&self) {
        // Skip the pass while mirroring is backed up.
        if !self.rx.is_empty() {
            trace!(pending = self.rx.len(), "queue busy, skipping cleanup");
            return;
        }
        if !self.queue.try_enqueue(Operation::Gc { reply: None }) {
            trace!("couldn't schedule cleanup");
        }
    }

    /// Run one operation. Returns false when the worker should stop.
    async fn execute(&mut self, queued: QueuedOperation) -> bool {
        let kind = queued.op.kind();
        trace!(op = kind, waited = ?queued.queued_at.elapsed(), "running operation");

        match queued.op {
            Operation::Mirror(op) => {
                if let Err(e) = self.mirror(&op).await {
                    error!(?op, error = %e, "couldn't mirror operation");
                }
            }
            Operation::CopyBack { path, flags, perm } => {
                let copied = copy_back(
                    self.temporary.as_ref(),
                    self.destination.as_ref(),
                    &path,
                    flags,
                    perm,
                )
                .await;
                match copied {
                    Ok(bytes) => trace!(path = %path.display(), bytes, "file mirrored"),
                    // Logged with the handle's flags inside copy_back.
                    Err(e) => debug!(path = %path.display(), error = %e, "copy-back dropped"),
                }
            }
            Operation::Gc { reply } => {
                let result = self.gc.run().await.map_err(MirrorError::Temporary);
                if let Some(reply) = reply {
                    if reply.send(result).is_err() {
                        debug!("gc requester went away");
                    }
                }
            }
            Operation::Barrier(done) => {
                if done.send(()).is_err() {
                    debug!("sync requester went away");
                }
            }
            Operation::Stop => {
                let pending = self.rx.len();
                if pending > 0 {
                    warn!(pending, "stopping with operations still queued");
                }
                return false;
            }
        }

        trace!(op = kind, "operation done");
        true
    }

    async fn mirror(&self, op: &Mirror) -> MirrorResult<()> {
        let dest = self.destination.as_ref();
        let result = match op {
            Mirror::Mkdir { path, perm } => dest.mkdir(path, *perm).await,
            Mirror::MkdirAll { path, perm } => dest.mkdir_all(path, *perm).await,
            Mirror::Remove { path } => dest.remove(path).await,
            Mirror::RemoveAll { path } => dest.remove_all(path).await,
            Mirror::Rename { from, to } => dest.rename(from, to).await,
            Mirror::SetAttr { path, attr } => dest.setattr(path, attr.clone()).await.map(|_| ()),
        };
        result.map_err(MirrorError::Destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Behavior;
    use crate::queue::OpQueue;
    use crate::vfs::MemoryBackend;

    fn worker(capacity: usize) -> (Worker, OpQueue) {
        let (queue, rx) = OpQueue::bounded(capacity);
        let temporary: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        let destination: Arc<dyn VfsOps> = Arc::new(MemoryBackend::new());
        let behavior = Behavior::default().resolve().unwrap();
        let gc = GarbageCollector::new(temporary.clone(), &behavior);
        let worker = Worker::new(
            rx,
            queue.downgrade(),
            temporary,
            destination,
            gc,
            behavior.cleanup_period,
            CancellationToken::new(),
        );
        (worker, queue)
    }

    #[tokio::test]
    async fn test_tick_schedules_gc_when_idle() {
        let (mut worker, queue) = worker(4);

        worker.on_tick();

        assert_eq!(queue.len(), 1);
        let queued = worker.rx.try_recv().unwrap();
        assert_eq!(queued.op.kind(), "gc");
    }

    #[tokio::test]
    async fn test_tick_skips_gc_while_queue_busy() {
        let (mut worker, queue) = worker(4);
        queue
            .enqueue(Operation::Mirror(Mirror::Remove { path: "x".into() }))
            .await
            .unwrap();

        worker.on_tick();

        assert_eq!(queue.len(), 1);
        let queued = worker.rx.try_recv().unwrap();
        assert_eq!(queued.op.kind(), "mirror");
        assert!(worker.rx.try_recv().is_err());
    }
}
