//! Layer application engine for rcl.
//!
//! This crate turns an ordered list of layer descriptors into a chain of
//! committed snapshots. The [`ChainBuilder`] computes chain IDs, builds
//! missing ancestors on demand and drives an [`Applier`] against freshly
//! prepared views; the [`LayerApplier`] extracts tar layers (with OCI
//! whiteouts) or artifact blobs into whatever mounts the snapshotter hands
//! out; the [`Unpacker`] resolves an image to its layers and records the
//! resulting rootfs identity on the content store.

pub mod apply;
pub mod archive;
pub mod chain;
pub mod concurrency;
pub mod import;
pub mod mount;
pub mod unpack;

pub use apply::{Applier, LayerApplier};
pub use archive::WhiteoutMode;
pub use chain::{ApplyReport, ChainBuilder, SNAPSHOT_LAYER_LABEL};
pub use concurrency::{install_signal_handler, shutdown_requested};
pub use import::{import_oci_layout, ImportReport};
pub use mount::{running_in_userns, TempMount};
pub use unpack::{UnpackOptions, UnpackReport, Unpacker, UNCOMPRESSED_LABEL};

use rcl_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("manifest error: {0}")]
    Manifest(#[from] rcl_schema::ManifestError),
    #[error("snapshot '{key}': {source}")]
    Snapshot {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to fetch {digest}: {source}")]
    Fetch {
        digest: String,
        #[source]
        source: StoreError,
    },
    #[error("integrity violation for layer {layer}: expected {expected}, applied {actual}")]
    Integrity {
        layer: String,
        expected: String,
        actual: String,
    },
    #[error("failed to apply {digest}: {source}")]
    Apply {
        digest: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported layer {digest}: {reason}")]
    Unsupported { digest: String, reason: String },
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("mount error: {0}")]
    Mount(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to clean up '{key}': {source}")]
    Cleanup {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Closed classification of [`CoreError`] for callers that branch on the
/// kind of failure rather than its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    IntegrityViolation,
    Io,
    Cleanup,
    Cancelled,
    Invalid,
}

fn store_kind(e: &StoreError) -> ErrorKind {
    if e.is_not_found() {
        ErrorKind::NotFound
    } else if e.is_already_exists() {
        ErrorKind::AlreadyExists
    } else if matches!(e, StoreError::IntegrityFailure { .. }) {
        ErrorKind::IntegrityViolation
    } else if matches!(e, StoreError::Io(_) | StoreError::LockFailed(_)) {
        ErrorKind::Io
    } else {
        ErrorKind::Invalid
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Store(e) | CoreError::Snapshot { source: e, .. } => store_kind(e),
            // Content that cannot be fetched is a transport failure for the
            // layer, never a missing-chain signal.
            CoreError::Fetch { source, .. } => match source {
                StoreError::IntegrityFailure { .. } => ErrorKind::IntegrityViolation,
                _ => ErrorKind::Io,
            },
            CoreError::Integrity { .. } => ErrorKind::IntegrityViolation,
            CoreError::Apply { .. } | CoreError::Mount(_) | CoreError::Io(_) => ErrorKind::Io,
            CoreError::Cleanup { .. } => ErrorKind::Cleanup,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Manifest(_)
            | CoreError::Unsupported { .. }
            | CoreError::UnsupportedPlatform(_)
            | CoreError::Serialization(_) => ErrorKind::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_kind_when_wrapped() {
        let nf = CoreError::Snapshot {
            key: "k".to_owned(),
            source: StoreError::SnapshotNotFound("p".to_owned()),
        };
        assert_eq!(nf.kind(), ErrorKind::NotFound);

        let exists = CoreError::Store(StoreError::AlreadyExists("k".to_owned()));
        assert_eq!(exists.kind(), ErrorKind::AlreadyExists);

        let corrupt = CoreError::Fetch {
            digest: "sha256:00".to_owned(),
            source: StoreError::IntegrityFailure {
                key: "b".to_owned(),
                expected: "x".to_owned(),
                actual: "y".to_owned(),
            },
        };
        assert_eq!(corrupt.kind(), ErrorKind::IntegrityViolation);
    }

    #[test]
    fn fetch_failures_are_io() {
        let missing = CoreError::Fetch {
            digest: "sha256:00".to_owned(),
            source: StoreError::BlobNotFound("sha256:00".to_owned()),
        };
        assert_eq!(missing.kind(), ErrorKind::Io);

        let cleanup = CoreError::Cleanup {
            key: "extract-1 sha256:00".to_owned(),
            source: StoreError::LockFailed("busy".to_owned()),
        };
        assert_eq!(cleanup.kind(), ErrorKind::Cleanup);
    }

    #[test]
    fn engine_errors_map_to_kinds() {
        let integrity = CoreError::Integrity {
            layer: "l".to_owned(),
            expected: "a".to_owned(),
            actual: "b".to_owned(),
        };
        assert_eq!(integrity.kind(), ErrorKind::IntegrityViolation);
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(CoreError::Mount("x".to_owned()).kind(), ErrorKind::Io);
        assert_eq!(
            CoreError::UnsupportedPlatform("windows/amd64".to_owned()).kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn integrity_message_names_layer_and_digests() {
        let e = CoreError::Integrity {
            layer: "sha256:aa".to_owned(),
            expected: "sha256:aa".to_owned(),
            actual: "sha256:bb".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("sha256:aa"));
        assert!(msg.contains("sha256:bb"));
    }
}
