//! Content-addressable blob store, image catalogue, and snapshot store for rcl.
//!
//! This crate provides the storage layer: a `ContentStore` keyed by OCI
//! digests with atomic writes, verified reads and per-blob labels, an
//! `ImageStore` mapping image names to their target descriptors, the
//! `Snapshotter` capability trait with its directory-backed
//! `LocalSnapshotter`, a write-ahead log for rolling back views left behind
//! by crashed builders, and the garbage collector and integrity checker.

pub mod config;
pub mod content;
pub mod gc;
pub mod images;
pub mod integrity;
pub mod layout;
pub mod local;
pub mod lock;
pub mod snapshot;
pub mod wal;

pub use config::{SnapshotterMode, StoreConfig};
pub use content::{ContentInfo, ContentSource, ContentStore};
pub use gc::{GarbageCollector, GcReport, GC_SNAPSHOT_LABEL_PREFIX};
pub use images::{ImageRecord, ImageStore};
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use local::LocalSnapshotter;
pub use lock::{GcLock, StoreLock, ViewLease};
pub use snapshot::{Labels, Mount, SnapshotInfo, SnapshotKind, Snapshotter};
pub use wal::{RollbackStep, WalEntry, WalOpKind, WriteAheadLog};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `dest` via a synced temp file in `dir` and an atomic rename.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot already exists: {0}")]
    AlreadyExists(String),
    #[error("snapshot '{key}' has {children} dependent snapshot(s)")]
    HasDependents { key: String, children: usize },
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("invalid content: {0}")]
    InvalidContent(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BlobNotFound(_)
                | StoreError::ImageNotFound(_)
                | StoreError::SnapshotNotFound(_)
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}
