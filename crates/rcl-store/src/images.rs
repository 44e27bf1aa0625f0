use crate::layout::StoreLayout;
use crate::StoreError;
use rcl_schema::{Descriptor, ImageName};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// A named image: the manifest or index descriptor it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: ImageName,
    pub target: Descriptor,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ImageRecord {
    pub fn new(name: ImageName, target: Descriptor) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            name,
            target,
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        }
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Image name to target descriptor catalogue, one JSON file per image.
pub struct ImageStore {
    layout: StoreLayout,
}

impl ImageStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.layout
            .images_dir()
            .join(format!("{}.json", blake3::hash(name.as_bytes()).to_hex()))
    }

    /// Insert or replace an image record. `created_at` survives replacement.
    pub fn put(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        if let Ok(existing) = self.get(&record.name) {
            record.created_at = existing.created_at;
            record.updated_at = chrono::Utc::now().to_rfc3339();
        }
        record.checksum = None;
        record.checksum = Some(record.compute_checksum()?);

        let dir = self.layout.images_dir();
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(&record)?;
        crate::write_atomic(&dir, &self.record_path(&record.name), content.as_bytes())
    }

    pub fn get(&self, name: &str) -> Result<ImageRecord, StoreError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(StoreError::ImageNotFound(name.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let record: ImageRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    key: name.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(StoreError::ImageNotFound(name.to_owned()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    /// All readable image records, sorted by name. Corrupt records are skipped.
    pub fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let (records, _) = self.list_with_errors()?;
        Ok(records)
    }

    /// Like [`list`](Self::list) but also returns the records that failed to load.
    pub fn list_with_errors(&self) -> Result<(Vec<ImageRecord>, Vec<(PathBuf, StoreError)>), StoreError> {
        let dir = self.layout.images_dir();
        if !dir.exists() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let loaded = fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|c| Ok(serde_json::from_str::<ImageRecord>(&c)?))
                .and_then(|r| self.get(&r.name));
            match loaded {
                Ok(r) => records.push(r),
                Err(e) => errors.push((path, e)),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((records, errors))
    }
}
