//! The snapshot store capability used by the chain builder.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Labels = BTreeMap<String, String>;

/// One filesystem mount needed to materialize a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type: `bind`, `overlay`, or `aufs`.
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    pub fn bind(source: impl Into<String>, readonly: bool) -> Self {
        Self {
            kind: "bind".to_owned(),
            source: source.into(),
            options: vec![
                "rbind".to_owned(),
                if readonly { "ro" } else { "rw" }.to_owned(),
            ],
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Writable, uncommitted.
    Active,
    /// Read-only, uncommitted.
    View,
    /// Immutable, addressable as a parent.
    Committed,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Active => write!(f, "active"),
            SnapshotKind::View => write!(f, "view"),
            SnapshotKind::Committed => write!(f, "committed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub kind: SnapshotKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    pub created_at: String,
    pub updated_at: String,
}

/// Copy-on-write snapshot primitives keyed by opaque strings.
///
/// Committed snapshots are immutable and may parent new snapshots. Active
/// snapshots are writable and exist only until committed or removed.
/// Implementations must report missing keys with an error for which
/// [`StoreError::is_not_found`] holds and taken keys with one for which
/// [`StoreError::is_already_exists`] holds; the chain builder depends on
/// both to drive lazy ancestor construction and to detect racing builders.
pub trait Snapshotter: Send + Sync {
    fn name(&self) -> &str;

    /// Look up a snapshot without side effects.
    fn stat(&self, key: &str) -> Result<SnapshotInfo, StoreError>;

    /// Create a writable snapshot on top of `parent` (or the empty root).
    fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: &Labels,
    ) -> Result<Vec<Mount>, StoreError>;

    /// Create a read-only snapshot on top of `parent`.
    fn view(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: &Labels,
    ) -> Result<Vec<Mount>, StoreError>;

    /// Mounts of an existing active snapshot or view.
    fn mounts(&self, key: &str) -> Result<Vec<Mount>, StoreError>;

    /// Seal the active snapshot `key` as the committed snapshot `name`.
    fn commit(&self, name: &str, key: &str, labels: &Labels) -> Result<(), StoreError>;

    /// Remove an uncommitted snapshot, or a committed one with no children.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<SnapshotInfo>, StoreError>;
}
