use crate::StoreError;
use rcl_schema::Digest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the rcl store.
///
/// Manages paths for content blobs and their labels, image records,
/// snapshots, the write-ahead log, scratch space, and the store version
/// marker. All subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("content").join("blobs")
    }

    #[inline]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir()
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    #[inline]
    pub fn labels_dir(&self) -> PathBuf {
        self.root.join("content").join("labels")
    }

    #[inline]
    pub fn labels_path(&self, digest: &Digest) -> PathBuf {
        self.labels_dir()
            .join(digest.algorithm().as_str())
            .join(format!("{}.json", digest.hex()))
    }

    /// Partially written blobs land here before being verified and renamed.
    #[inline]
    pub fn ingest_dir(&self) -> PathBuf {
        self.root.join("content").join("ingest")
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    #[inline]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Directory of a single snapshot. Keys are arbitrary strings, so the
    /// directory name is the blake3 hash of the key.
    #[inline]
    pub fn snapshot_dir(&self, key: &str) -> PathBuf {
        self.snapshots_dir()
            .join(blake3::hash(key.as_bytes()).to_hex().as_str())
    }

    #[inline]
    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    /// Scratch space for temporary mount points.
    #[inline]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Shared by unpacks and imports, exclusive for garbage collection.
    #[inline]
    pub fn gc_lock_file(&self) -> PathBuf {
        self.root.join(".gc.lock")
    }

    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("rcl.toml")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        for alg in ["sha256", "sha512"] {
            fs::create_dir_all(self.blobs_dir().join(alg))?;
            fs::create_dir_all(self.labels_dir().join(alg))?;
        }
        fs::create_dir_all(self.ingest_dir())?;
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.snapshots_dir())?;
        fs::create_dir_all(self.wal_dir())?;
        fs::create_dir_all(self.tmp_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&self.root, &version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
