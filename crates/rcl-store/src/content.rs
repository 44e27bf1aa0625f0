use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::snapshot::Labels;
use crate::StoreError;
use rcl_schema::{Descriptor, Digest, Digester};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use tempfile::NamedTempFile;
use tracing::debug;

/// Resolves a descriptor to the bytes it names.
pub trait ContentSource: Send + Sync {
    fn fetch(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: u64,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LabelsFile {
    labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

fn labels_checksum(labels: &Labels) -> Result<String, StoreError> {
    let json = serde_json::to_string(labels)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Digest-addressed blob store with verified reads and per-blob labels.
///
/// Blobs are written through a temp file in `content/ingest/`, verified
/// against their expected digest and size, and renamed into place. A blob
/// path therefore only ever holds complete, verified content.
pub struct ContentStore {
    layout: StoreLayout,
}

impl ContentStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Store `data` under its sha256 digest.
    pub fn put(&self, data: &[u8]) -> Result<Digest, StoreError> {
        let digest = Digest::sha256(data);
        let dest = self.layout.blob_path(&digest);
        if dest.exists() {
            return Ok(digest);
        }
        self.write_blob(&digest, data)?;
        Ok(digest)
    }

    /// Copy `reader` into the store, verifying it against `expected`.
    ///
    /// Already-present blobs are not rewritten; the reader is left untouched.
    pub fn ingest(&self, reader: &mut dyn Read, expected: &Descriptor) -> Result<(), StoreError> {
        let dest = self.layout.blob_path(&expected.digest);
        if dest.exists() {
            return Ok(());
        }

        let ingest_dir = self.layout.ingest_dir();
        fs::create_dir_all(&ingest_dir)?;
        let mut tmp = NamedTempFile::new_in(&ingest_dir)?;
        let mut digester = Digester::new(expected.digest.algorithm());
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            digester.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }

        let size = digester.written();
        if size != expected.size {
            return Err(StoreError::InvalidContent(format!(
                "{}: expected {} bytes, got {size}",
                expected.digest, expected.size
            )));
        }
        let actual = digester.finalize();
        if actual != expected.digest {
            return Err(StoreError::IntegrityFailure {
                key: expected.digest.to_string(),
                expected: expected.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        tmp.as_file().sync_all()?;
        let parent = self.blob_parent(&expected.digest)?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&parent)?;
        debug!("ingested {} ({size} bytes)", expected.digest);
        Ok(())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.layout.blob_path(digest).exists()
    }

    /// Open a blob for streaming. The caller is responsible for verification.
    pub fn open(&self, digest: &Digest) -> Result<File, StoreError> {
        File::open(self.layout.blob_path(digest)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::BlobNotFound(digest.to_string()),
            _ => StoreError::Io(e),
        })
    }

    /// Read a whole blob, verifying its digest.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let mut data = Vec::new();
        self.open(digest)?.read_to_end(&mut data)?;

        let mut digester = Digester::new(digest.algorithm());
        digester.update(&data);
        let actual = digester.finalize();
        if &actual != digest {
            return Err(StoreError::IntegrityFailure {
                key: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Re-hash a blob from disk without loading it into memory.
    pub fn verify(&self, digest: &Digest) -> Result<(), StoreError> {
        let mut file = self.open(digest)?;
        let mut digester = Digester::new(digest.algorithm());
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        let actual = digester.finalize();
        if &actual != digest {
            return Err(StoreError::IntegrityFailure {
                key: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    pub fn info(&self, digest: &Digest) -> Result<ContentInfo, StoreError> {
        let meta = fs::metadata(self.layout.blob_path(digest)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::BlobNotFound(digest.to_string()),
            _ => StoreError::Io(e),
        })?;
        Ok(ContentInfo {
            digest: digest.clone(),
            size: meta.len(),
            labels: self.labels(digest)?,
        })
    }

    pub fn labels(&self, digest: &Digest) -> Result<Labels, StoreError> {
        let path = self.layout.labels_path(digest);
        if !path.exists() {
            return Ok(Labels::new());
        }
        let content = fs::read_to_string(&path)?;
        let file: LabelsFile = serde_json::from_str(&content)?;
        if let Some(expected) = &file.checksum {
            let actual = labels_checksum(&file.labels)?;
            if &actual != expected {
                return Err(StoreError::IntegrityFailure {
                    key: format!("labels of {digest}"),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(file.labels)
    }

    /// Upsert a single label. Idempotent.
    pub fn set_label(&self, digest: &Digest, key: &str, value: &str) -> Result<(), StoreError> {
        let mut labels = Labels::new();
        labels.insert(key.to_owned(), value.to_owned());
        self.update_labels(digest, &labels)
    }

    /// Merge `updates` into the blob's labels under the store lock.
    pub fn update_labels(&self, digest: &Digest, updates: &Labels) -> Result<(), StoreError> {
        if !self.exists(digest) {
            return Err(StoreError::BlobNotFound(digest.to_string()));
        }
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;

        let mut labels = self.labels(digest)?;
        let before = labels.clone();
        labels.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        if labels == before && self.layout.labels_path(digest).exists() {
            return Ok(());
        }

        let file = LabelsFile {
            checksum: Some(labels_checksum(&labels)?),
            labels,
        };
        let content = serde_json::to_string_pretty(&file)?;
        let path = self.layout.labels_path(digest);
        let dir = path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| self.layout.labels_dir());
        fs::create_dir_all(&dir)?;
        crate::write_atomic(&dir, &path, content.as_bytes())?;
        debug!("labels updated for {digest}");
        Ok(())
    }

    pub fn remove(&self, digest: &Digest) -> Result<(), StoreError> {
        let path = self.layout.blob_path(digest);
        if !path.exists() {
            return Err(StoreError::BlobNotFound(digest.to_string()));
        }
        fs::remove_file(&path)?;
        let labels = self.layout.labels_path(digest);
        if labels.exists() {
            fs::remove_file(&labels)?;
        }
        Ok(())
    }

    /// All stored blob digests, sorted.
    pub fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let dir = self.layout.blobs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut digests = Vec::new();
        for alg_entry in fs::read_dir(&dir)? {
            let alg_entry = alg_entry?;
            if !alg_entry.file_type()?.is_dir() {
                continue;
            }
            let alg = alg_entry.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(alg_entry.path())? {
                let entry = entry?;
                let hex = entry.file_name().to_string_lossy().into_owned();
                // Stray files that do not parse as digests are ignored.
                if let Ok(d) = Digest::parse(&format!("{alg}:{hex}")) {
                    digests.push(d);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<(), StoreError> {
        let parent = self.blob_parent(digest)?;
        crate::write_atomic(&parent, &self.layout.blob_path(digest), data)
    }

    fn blob_parent(&self, digest: &Digest) -> Result<std::path::PathBuf, StoreError> {
        let parent = self
            .layout
            .blobs_dir()
            .join(digest.algorithm().as_str());
        fs::create_dir_all(&parent)?;
        Ok(parent)
    }
}

impl ContentSource for ContentStore {
    fn fetch(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>, StoreError> {
        Ok(Box::new(self.open(&desc.digest)?))
    }
}
