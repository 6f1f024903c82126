//! Shared helpers for mirrorfs integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use mirrorfs::{
    Behavior, DirEntry, FileAttr, MemoryBackend, MirrorConfig, MirrorFs, OpenFlags, SetAttr,
    VfsFile, VfsOps, VfsResult,
};

/// Memory backend whose path operations wait until the gate opens.
///
/// Stands in for a slow destination: the worker blocks inside the first
/// operation it runs, so everything behind it stays queued.
pub struct GatedBackend {
    inner: MemoryBackend,
    gate: Semaphore,
    opened: AtomicBool,
}

impl GatedBackend {
    pub fn closed() -> Self {
        Self {
            inner: MemoryBackend::new(),
            gate: Semaphore::new(0),
            opened: AtomicBool::new(false),
        }
    }

    pub fn open_gate(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.gate.add_permits(1);
        }
    }

    /// The backing store, bypassing the gate.
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    async fn pass(&self) {
        // The permit goes back on drop, so an open gate stays open.
        let _permit = self.gate.acquire().await.expect("gate semaphore closed");
    }
}

#[async_trait]
impl VfsOps for GatedBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        self.pass().await;
        self.inner.getattr(path).await
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        self.pass().await;
        self.inner.readdir(path).await
    }

    async fn open(&self, path: &Path, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn VfsFile>> {
        self.pass().await;
        self.inner.open(path, flags, perm).await
    }

    async fn mkdir(&self, path: &Path, perm: u32) -> VfsResult<()> {
        self.pass().await;
        self.inner.mkdir(path, perm).await
    }

    async fn mkdir_all(&self, path: &Path, perm: u32) -> VfsResult<()> {
        self.pass().await;
        self.inner.mkdir_all(path, perm).await
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        self.pass().await;
        self.inner.remove(path).await
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        self.pass().await;
        self.inner.remove_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        self.pass().await;
        self.inner.rename(from, to).await
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        self.pass().await;
        self.inner.setattr(path, attr).await
    }
}

/// Mirror over a memory temporary backend and the given destination.
pub fn mirror_over(
    destination: Arc<dyn VfsOps>,
    behavior: Behavior,
) -> (MirrorFs, Arc<MemoryBackend>) {
    let temp = Arc::new(MemoryBackend::new());
    let fs = MirrorFs::new(
        MirrorConfig::new(destination)
            .with_temporary(temp.clone())
            .with_behavior(behavior),
    )
    .expect("mirror fs");
    (fs, temp)
}

/// Write a whole file through the layer.
pub async fn write_file(fs: &MirrorFs, path: &str, data: &[u8]) {
    let mut file = fs.create(path, 0o644).await.expect("create");
    mirrorfs::vfs::write_fully(file.as_mut(), data)
        .await
        .expect("write");
    file.close().await.expect("close");
}

/// Wait until the worker has picked up everything queued so far.
pub async fn wait_for_drain(fs: &MirrorFs) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while fs.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue never drained");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
