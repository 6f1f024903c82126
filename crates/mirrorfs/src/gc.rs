//! Garbage collection of the temporary backend.
//!
//! A pass walks the temporary tree depth-first in listing order. Each file
//! or directory is kept while it is younger than the minimum age and the
//! pass has kept fewer than the minimum count; everything else is removed.
//! A directory that still had entries when it was listed is never removed,
//! so emptied directories go away on a later pass.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedBehavior;
use crate::vfs::{VfsOps, VfsResult};

/// Counters from one GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Entries left in place (young files and non-empty directories).
    pub kept: usize,
    /// Entries removed.
    pub deleted: usize,
    /// Removals that failed. These are retried on the next pass.
    pub failed: usize,
}

/// Evicts old entries from the temporary backend.
pub(crate) struct GarbageCollector {
    fs: Arc<dyn VfsOps>,
    min_retained_files: Option<usize>,
    min_file_age: Duration,
}

struct GcPass {
    cutoff: SystemTime,
    stats: GcStats,
}

impl GcPass {
    fn new(min_file_age: Duration) -> Self {
        let cutoff = SystemTime::now()
            .checked_sub(min_file_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            cutoff,
            stats: GcStats::default(),
        }
    }

    fn should_keep(&self, mtime: SystemTime, min_retained_files: Option<usize>) -> bool {
        mtime > self.cutoff && min_retained_files.is_none_or(|min| self.stats.kept < min)
    }
}

impl GarbageCollector {
    pub(crate) fn new(fs: Arc<dyn VfsOps>, behavior: &ResolvedBehavior) -> Self {
        Self {
            fs,
            min_retained_files: behavior.min_retained_files,
            min_file_age: behavior.min_file_age,
        }
    }

    /// Run one pass over the whole temporary tree.
    ///
    /// Only a failure to list the root is an error; problems below it are
    /// logged and counted.
    pub(crate) async fn run(&self) -> VfsResult<GcStats> {
        let mut pass = GcPass::new(self.min_file_age);
        info!(
            component = "gc",
            min_retained_files = ?self.min_retained_files,
            min_file_age = ?self.min_file_age,
            "starting garbage collection"
        );

        let result = self.explore(Path::new(""), &mut pass).await;

        let GcStats {
            kept,
            deleted,
            failed,
        } = pass.stats;
        match &result {
            Ok(_) => info!(component = "gc", kept, deleted, failed, "garbage collection finished"),
            Err(e) => error!(component = "gc", error = %e, "garbage collection aborted"),
        }
        result.map(|_| pass.stats)
    }

    /// Visit `dir`, returning how many entries it held when listed.
    fn explore<'a>(&'a self, dir: &'a Path, pass: &'a mut GcPass) -> BoxFuture<'a, VfsResult<usize>> {
        Box::pin(async move {
            let entries = self.fs.readdir(dir).await?;

            for entry in &entries {
                let path = dir.join(&entry.name);

                if entry.kind.is_dir() {
                    match self.explore(&path, pass).await {
                        Ok(0) => {}
                        Ok(_) => {
                            pass.stats.kept += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!(component = "gc", path = %path.display(), error = %e, "couldn't list directory, keeping it");
                            pass.stats.kept += 1;
                            continue;
                        }
                    }
                }

                let attr = match self.fs.getattr(&path).await {
                    Ok(attr) => attr,
                    Err(e) => {
                        // Removed underneath us since the listing.
                        debug!(component = "gc", path = %path.display(), error = %e, "skipping entry");
                        continue;
                    }
                };

                if pass.should_keep(attr.mtime, self.min_retained_files) {
                    pass.stats.kept += 1;
                    continue;
                }

                info!(component = "gc", path = %path.display(), "deleting file");
                match self.fs.remove(&path).await {
                    Ok(()) => pass.stats.deleted += 1,
                    Err(e) => {
                        error!(component = "gc", path = %path.display(), error = %e, "couldn't delete file");
                        pass.stats.failed += 1;
                    }
                }
            }

            Ok(entries.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Behavior;
    use crate::vfs::{
        DirEntry, FileAttr, MemoryBackend, OpenFlags, SetAttr, VfsError, VfsFile,
    };
    use async_trait::async_trait;

    const HOUR: Duration = Duration::from_secs(3600);

    fn collector(fs: Arc<dyn VfsOps>, min: Option<usize>, age: Duration) -> GarbageCollector {
        let behavior = Behavior::default()
            .with_min_retained_files(min)
            .with_min_file_age(age)
            .resolve()
            .unwrap();
        GarbageCollector::new(fs, &behavior)
    }

    async fn write(fs: &MemoryBackend, path: &str) {
        fs.write_all(Path::new(path), b"data", 0o644).await.unwrap();
    }

    async fn write_old(fs: &MemoryBackend, path: &str) {
        write(fs, path).await;
        let long_ago = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        fs.setattr(Path::new(path), SetAttr::new().with_times(long_ago, long_ago))
            .await
            .unwrap();
    }

    async fn exists(fs: &MemoryBackend, path: &str) -> bool {
        fs.exists(Path::new(path)).await
    }

    #[tokio::test]
    async fn test_count_budget_keeps_first_young_files() {
        let fs = Arc::new(MemoryBackend::new());
        write(&fs, "f1").await;
        write(&fs, "f2").await;
        write(&fs, "f3").await;

        let stats = collector(fs.clone(), Some(2), HOUR).run().await.unwrap();

        assert_eq!(
            stats,
            GcStats {
                kept: 2,
                deleted: 1,
                failed: 0
            }
        );
        assert!(exists(&fs, "f1").await);
        assert!(exists(&fs, "f2").await);
        assert!(!exists(&fs, "f3").await);
    }

    #[tokio::test]
    async fn test_old_files_deleted_regardless_of_budget() {
        let fs = Arc::new(MemoryBackend::new());
        write_old(&fs, "a").await;
        write_old(&fs, "b").await;
        write(&fs, "c").await;

        let stats = collector(fs.clone(), Some(10), HOUR).run().await.unwrap();

        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.kept, 1);
        assert!(!exists(&fs, "a").await);
        assert!(!exists(&fs, "b").await);
        assert!(exists(&fs, "c").await);
    }

    #[tokio::test]
    async fn test_no_count_budget_is_pure_age_eviction() {
        let fs = Arc::new(MemoryBackend::new());
        for i in 0..20 {
            write(&fs, &format!("young{i:02}")).await;
        }
        write_old(&fs, "old").await;

        let stats = collector(fs.clone(), None, HOUR).run().await.unwrap();

        assert_eq!(stats.kept, 20);
        assert_eq!(stats.deleted, 1);
        assert!(!exists(&fs, "old").await);
    }

    #[tokio::test]
    async fn test_non_empty_directory_never_removed() {
        let fs = Arc::new(MemoryBackend::new());
        write(&fs, "d/young").await;
        // The directory itself is old, but it still has content.
        let long_ago = SystemTime::UNIX_EPOCH;
        fs.setattr(Path::new("d"), SetAttr::new().with_times(long_ago, long_ago))
            .await
            .unwrap();

        let stats = collector(fs.clone(), Some(10), HOUR).run().await.unwrap();

        assert_eq!(stats.kept, 2);
        assert_eq!(stats.deleted, 0);
        assert!(exists(&fs, "d").await);
        assert!(exists(&fs, "d/young").await);
    }

    #[tokio::test]
    async fn test_emptied_directories_go_on_later_passes() {
        let fs = Arc::new(MemoryBackend::new());
        write(&fs, "a/b/file").await;
        let gc = collector(fs.clone(), Some(0), Duration::ZERO);

        gc.run().await.unwrap();
        assert!(!exists(&fs, "a/b/file").await);
        assert!(exists(&fs, "a/b").await);

        gc.run().await.unwrap();
        assert!(!exists(&fs, "a/b").await);
        assert!(exists(&fs, "a").await);

        gc.run().await.unwrap();
        assert!(!exists(&fs, "a").await);

        let stats = gc.run().await.unwrap();
        assert_eq!(stats, GcStats::default());
    }

    #[tokio::test]
    async fn test_kept_directories_use_budget_in_listing_order() {
        let fs = Arc::new(MemoryBackend::new());
        write(&fs, "a/inner").await;
        write(&fs, "b").await;

        // "a/inner" takes the only slot, then "a" is kept for being non-empty.
        let stats = collector(fs.clone(), Some(1), HOUR).run().await.unwrap();

        assert_eq!(stats.kept, 2);
        assert_eq!(stats.deleted, 1);
        assert!(exists(&fs, "a/inner").await);
        assert!(!exists(&fs, "b").await);
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let fs = Arc::new(MemoryBackend::new());
        let stats = collector(fs, Some(3), HOUR).run().await.unwrap();
        assert_eq!(stats, GcStats::default());
    }

    /// Backend whose removals always fail.
    struct StickyBackend(MemoryBackend);

    #[async_trait]
    impl VfsOps for StickyBackend {
        async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
            self.0.getattr(path).await
        }
        async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
            self.0.readdir(path).await
        }
        async fn open(&self, path: &Path, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn VfsFile>> {
            self.0.open(path, flags, perm).await
        }
        async fn mkdir(&self, path: &Path, perm: u32) -> VfsResult<()> {
            self.0.mkdir(path, perm).await
        }
        async fn mkdir_all(&self, path: &Path, perm: u32) -> VfsResult<()> {
            self.0.mkdir_all(path, perm).await
        }
        async fn remove(&self, path: &Path) -> VfsResult<()> {
            Err(VfsError::permission_denied(path.to_string_lossy()))
        }
        async fn remove_all(&self, path: &Path) -> VfsResult<()> {
            Err(VfsError::permission_denied(path.to_string_lossy()))
        }
        async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
            self.0.rename(from, to).await
        }
        async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
            self.0.setattr(path, attr).await
        }
    }

    #[tokio::test]
    async fn test_failed_deletions_are_counted_and_pass_continues() {
        let inner = MemoryBackend::new();
        write_old(&inner, "a").await;
        write_old(&inner, "b").await;
        let fs = Arc::new(StickyBackend(inner));

        let stats = collector(fs.clone(), Some(10), HOUR).run().await.unwrap();

        assert_eq!(
            stats,
            GcStats {
                kept: 0,
                deleted: 0,
                failed: 2
            }
        );
        assert!(fs.exists(Path::new("a")).await);
        assert!(fs.exists(Path::new("b")).await);
    }
}
