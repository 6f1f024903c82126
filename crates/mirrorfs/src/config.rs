//! Mirroring and eviction configuration.
//!
//! [`Behavior`] is the user-facing, partially specified form (it can be
//! loaded from TOML); [`ResolvedBehavior`] is what the running filesystem
//! uses, with every default applied and validated.
//!
//! ```toml
//! min_retained_files = 10     # or "none" to turn off count-based retention
//! min_file_age = "20m"
//! queue_capacity = 1000
//! cleanup_period = "10m"      # defaults to half of min_file_age
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::{MirrorError, MirrorResult};
use crate::vfs::VfsOps;

/// Default number of files a GC pass keeps regardless of age.
pub const DEFAULT_MIN_RETAINED_FILES: usize = 10;

/// Default age below which files are protected from eviction.
pub const DEFAULT_MIN_FILE_AGE: Duration = Duration::from_secs(20 * 60);

/// Default number of pending operations before callers are held back.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Lower bound for the GC timer.
pub const MIN_CLEANUP_PERIOD: Duration = Duration::from_millis(100);

/// Eviction and queueing behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Behavior {
    /// Files kept per pass while they are younger than `min_file_age`.
    /// `None` turns count-based retention off, leaving pure age-based eviction.
    #[serde(deserialize_with = "retained_files::deserialize")]
    pub min_retained_files: Option<usize>,
    /// Files younger than this are eligible to be kept.
    #[serde(with = "humantime_serde")]
    pub min_file_age: Duration,
    /// Capacity of the operation queue.
    pub queue_capacity: usize,
    /// Period of the GC timer. Defaults to half of `min_file_age`.
    #[serde(with = "humantime_serde")]
    pub cleanup_period: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            min_retained_files: Some(DEFAULT_MIN_RETAINED_FILES),
            min_file_age: DEFAULT_MIN_FILE_AGE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cleanup_period: None,
        }
    }
}

impl Behavior {
    /// Parse a behavior from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> MirrorResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a behavior from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| MirrorError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Set the minimum retained file count (`None` disables it).
    pub fn with_min_retained_files(mut self, count: Option<usize>) -> Self {
        self.min_retained_files = count;
        self
    }

    /// Set the minimum file age.
    pub fn with_min_file_age(mut self, age: Duration) -> Self {
        self.min_file_age = age;
        self
    }

    /// Set the operation queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the GC timer period.
    pub fn with_cleanup_period(mut self, period: Duration) -> Self {
        self.cleanup_period = Some(period);
        self
    }

    /// Validate and apply derived defaults.
    pub fn resolve(&self) -> MirrorResult<ResolvedBehavior> {
        if self.queue_capacity == 0 {
            return Err(MirrorError::InvalidBehavior(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(MirrorError::InvalidBehavior(format!(
                "queue_capacity must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        let cleanup_period = self
            .cleanup_period
            .unwrap_or(self.min_file_age / 2)
            .max(MIN_CLEANUP_PERIOD);

        Ok(ResolvedBehavior {
            min_retained_files: self.min_retained_files,
            min_file_age: self.min_file_age,
            queue_capacity: self.queue_capacity,
            cleanup_period,
        })
    }
}

/// Validated behavior used by a running filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBehavior {
    pub min_retained_files: Option<usize>,
    pub min_file_age: Duration,
    pub queue_capacity: usize,
    /// Always at least [`MIN_CLEANUP_PERIOD`].
    pub cleanup_period: Duration,
}

/// Everything needed to build a [`MirrorFs`](crate::MirrorFs).
#[derive(Clone, Default)]
pub struct MirrorConfig {
    /// Durable side of the mirror. Required.
    pub destination: Option<Arc<dyn VfsOps>>,
    /// Fast local side. Defaults to a fresh private temporary directory.
    pub temporary: Option<Arc<dyn VfsOps>>,
    pub behavior: Behavior,
}

impl MirrorConfig {
    /// Config mirroring into `destination` with default behavior.
    pub fn new(destination: Arc<dyn VfsOps>) -> Self {
        Self {
            destination: Some(destination),
            ..Default::default()
        }
    }

    /// Use `temporary` instead of a private temporary directory.
    pub fn with_temporary(mut self, temporary: Arc<dyn VfsOps>) -> Self {
        self.temporary = Some(temporary);
        self
    }

    /// Replace the behavior.
    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

/// TOML form of `min_retained_files`: a count, or `"none"`.
mod retained_files {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Count(usize),
        Keyword(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Count(n) => Ok(Some(n)),
            Repr::Keyword(k) if k.eq_ignore_ascii_case("none") => Ok(None),
            Repr::Keyword(k) => Err(D::Error::custom(format!(
                "expected a file count or \"none\", got {k:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let resolved = Behavior::default().resolve().unwrap();
        assert_eq!(resolved.min_retained_files, Some(10));
        assert_eq!(resolved.min_file_age, Duration::from_secs(1200));
        assert_eq!(resolved.queue_capacity, 1000);
        assert_eq!(resolved.cleanup_period, Duration::from_secs(600));
    }

    #[test]
    fn test_cleanup_period_floor() {
        let resolved = Behavior::default()
            .with_min_file_age(Duration::from_millis(1))
            .resolve()
            .unwrap();
        assert_eq!(resolved.cleanup_period, MIN_CLEANUP_PERIOD);

        let resolved = Behavior::default()
            .with_cleanup_period(Duration::from_millis(1))
            .resolve()
            .unwrap();
        assert_eq!(resolved.cleanup_period, MIN_CLEANUP_PERIOD);
    }

    #[test]
    fn test_explicit_cleanup_period_wins() {
        let resolved = Behavior::default()
            .with_cleanup_period(Duration::from_secs(5))
            .resolve()
            .unwrap();
        assert_eq!(resolved.cleanup_period, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Behavior::default().with_queue_capacity(0).resolve().unwrap_err();
        assert!(matches!(err, MirrorError::InvalidBehavior(_)));
    }

    #[test]
    fn test_oversized_capacity_rejected() {
        let behavior = Behavior::from_toml_str("queue_capacity = 9223372036854775807").unwrap();
        let err = behavior.resolve().unwrap_err();
        assert!(matches!(err, MirrorError::InvalidBehavior(_)));

        let largest = Behavior::default().with_queue_capacity(Semaphore::MAX_PERMITS);
        assert_eq!(largest.resolve().unwrap().queue_capacity, Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_from_toml() {
        let behavior = Behavior::from_toml_str(
            r#"
            min_retained_files = 3
            min_file_age = "200ms"
            cleanup_period = "1s"
            "#,
        )
        .unwrap();
        assert_eq!(behavior.min_retained_files, Some(3));
        assert_eq!(behavior.min_file_age, Duration::from_millis(200));
        assert_eq!(behavior.cleanup_period, Some(Duration::from_secs(1)));
        assert_eq!(behavior.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_from_toml_disable_count() {
        let behavior = Behavior::from_toml_str(r#"min_retained_files = "none""#).unwrap();
        assert_eq!(behavior.min_retained_files, None);

        assert!(Behavior::from_toml_str(r#"min_retained_files = "all""#).is_err());
        assert!(Behavior::from_toml_str("unknown_key = 1").is_err());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Behavior::from_toml_str("").unwrap(), Behavior::default());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Behavior::load("/nonexistent/mirrorfs.toml").unwrap_err();
        assert!(matches!(err, MirrorError::ConfigIo { .. }));
    }
}
