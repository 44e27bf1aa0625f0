//! Directory-backed snapshotter.
//!
//! Every snapshot lives in `snapshots/<blake3(key)>/` with an `info.json`
//! record, an `fs/` tree and, while uncommitted, a `lease` file locked by
//! the owning process. Committing renames the directory to the hash of the
//! committed name, so a snapshot becomes visible under its new key in a
//! single atomic step.

use crate::config::SnapshotterMode;
use crate::layout::StoreLayout;
use crate::lock::{StoreLock, ViewLease};
use crate::snapshot::{Labels, Mount, SnapshotInfo, SnapshotKind, Snapshotter};
use crate::wal::{RollbackStep, WalOpKind, WriteAheadLog};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const INFO_FILE: &str = "info.json";
const LEASE_FILE: &str = "lease";
const FS_DIR: &str = "fs";
const WORK_DIR: &str = "work";

/// On-disk form of a snapshot's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotRecord {
    pub info: SnapshotInfo,
    pub mode: SnapshotterMode,
    /// WAL operation that created this snapshot, until it is committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SnapshotRecord {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Read and verify the record stored in a snapshot directory.
pub(crate) fn load_record(dir: &Path) -> Result<SnapshotRecord, StoreError> {
    let content = fs::read_to_string(dir.join(INFO_FILE))?;
    let record: SnapshotRecord = serde_json::from_str(&content)?;
    if let Some(ref expected) = record.checksum {
        let actual = record.compute_checksum()?;
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                key: record.info.key.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(record)
}

pub struct LocalSnapshotter {
    layout: StoreLayout,
    mode: SnapshotterMode,
    wal: WriteAheadLog,
    leases: Mutex<HashMap<String, ViewLease>>,
}

impl LocalSnapshotter {
    pub fn new(layout: StoreLayout, mode: SnapshotterMode) -> Self {
        let wal = WriteAheadLog::new(&layout);
        Self {
            layout,
            mode,
            wal,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> SnapshotterMode {
        self.mode
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Root of the filesystem tree of a snapshot.
    pub fn fs_path(&self, key: &str) -> PathBuf {
        self.layout.snapshot_dir(key).join(FS_DIR)
    }

    fn read_record(&self, key: &str) -> Result<SnapshotRecord, StoreError> {
        let dir = self.layout.snapshot_dir(key);
        if !dir.join(INFO_FILE).exists() {
            return Err(StoreError::SnapshotNotFound(key.to_owned()));
        }
        let record = load_record(&dir)?;
        // A record whose key disagrees with its directory is a commit that
        // crashed between rewriting info.json and the rename.
        if record.info.key != key {
            return Err(StoreError::SnapshotNotFound(key.to_owned()));
        }
        Ok(record)
    }

    fn write_record(&self, dir: &Path, record: &SnapshotRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.checksum = None;
        record.checksum = Some(record.compute_checksum()?);
        let content = serde_json::to_string_pretty(&record)?;
        crate::write_atomic(dir, &dir.join(INFO_FILE), content.as_bytes())
    }

    /// Every snapshot directory with its parsed record, or the load error.
    #[allow(clippy::type_complexity)]
    pub(crate) fn scan(
        &self,
    ) -> Result<Vec<(PathBuf, Result<SnapshotRecord, StoreError>)>, StoreError> {
        let dir = self.layout.snapshots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let loaded = if path.join(INFO_FILE).exists() {
                load_record(&path)
            } else {
                Err(StoreError::SnapshotNotFound(path.display().to_string()))
            };
            out.push((path, loaded));
        }
        Ok(out)
    }

    /// Valid records whose directory matches their key.
    fn records(&self) -> Result<Vec<SnapshotRecord>, StoreError> {
        let mut records = Vec::new();
        for (path, loaded) in self.scan()? {
            match loaded {
                Ok(r) if path == self.layout.snapshot_dir(&r.info.key) => records.push(r),
                Ok(r) => debug!("skipping {}: key '{}' does not match", path.display(), r.info.key),
                Err(StoreError::SnapshotNotFound(_)) => {}
                Err(e) => warn!("skipping unreadable snapshot {}: {e}", path.display()),
            }
        }
        records.sort_by(|a, b| a.info.key.cmp(&b.info.key));
        Ok(records)
    }

    fn lease_table(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, ViewLease>>, StoreError> {
        self.leases
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("lease table poisoned: {e}")))
    }

    fn create(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: &Labels,
        kind: SnapshotKind,
    ) -> Result<Vec<Mount>, StoreError> {
        let dir = self.layout.snapshot_dir(key);
        let (record, op_id, lease) = {
            let _lock = StoreLock::acquire(&self.layout.lock_file())?;
            if dir.exists() {
                return Err(StoreError::AlreadyExists(key.to_owned()));
            }
            if let Some(p) = parent {
                let parent_record = self.read_record(p)?;
                if parent_record.info.kind != SnapshotKind::Committed {
                    return Err(StoreError::FailedPrecondition(format!(
                        "parent '{p}' is not committed"
                    )));
                }
                if parent_record.mode != self.mode {
                    return Err(StoreError::FailedPrecondition(format!(
                        "parent '{p}' was created by the {} snapshotter",
                        parent_record.mode
                    )));
                }
            }

            let op_kind = match kind {
                SnapshotKind::View => WalOpKind::View,
                _ => WalOpKind::Prepare,
            };
            let op_id = self.wal.begin(op_kind, key)?;
            match self.materialize_dir(&dir, key, parent, labels, kind, &op_id) {
                Ok((record, lease)) => (record, op_id, lease),
                Err(e) => {
                    self.discard(&dir, Some(&op_id));
                    return Err(e);
                }
            }
        };

        // Copying the parent tree happens outside the store lock. The new
        // record already names its parent, so the parent cannot be removed.
        if self.mode == SnapshotterMode::Native {
            if let Some(p) = parent {
                if let Err(e) = copy_tree(&self.fs_path(p), &dir.join(FS_DIR)) {
                    drop(lease);
                    self.discard(&dir, Some(&op_id));
                    return Err(e);
                }
            }
        }

        let mounts = self.mounts_for(&record)?;
        self.lease_table()?.insert(key.to_owned(), lease);
        debug!("{kind} snapshot {key} created (parent: {parent:?})");
        Ok(mounts)
    }

    fn materialize_dir(
        &self,
        dir: &Path,
        key: &str,
        parent: Option<&str>,
        labels: &Labels,
        kind: SnapshotKind,
        op_id: &str,
    ) -> Result<(SnapshotRecord, ViewLease), StoreError> {
        self.wal
            .add_rollback_step(op_id, RollbackStep::RemoveDir(dir.to_path_buf()))?;
        fs::create_dir_all(dir.join(FS_DIR))?;
        if self.mode == SnapshotterMode::Overlay {
            fs::create_dir_all(dir.join(WORK_DIR))?;
        }
        let lease = ViewLease::try_acquire(&dir.join(LEASE_FILE))?
            .ok_or_else(|| StoreError::LockFailed(format!("lease for {key} is held")))?;

        let now = chrono::Utc::now().to_rfc3339();
        let record = SnapshotRecord {
            info: SnapshotInfo {
                key: key.to_owned(),
                kind,
                parent: parent.map(str::to_owned),
                labels: labels.clone(),
                created_at: now.clone(),
                updated_at: now,
            },
            mode: self.mode,
            wal_op: Some(op_id.to_owned()),
            checksum: None,
        };
        self.write_record(dir, &record)?;
        crate::fsync_dir(&self.layout.snapshots_dir())?;
        Ok((record, lease))
    }

    /// Best-effort removal of a half-created snapshot directory.
    fn discard(&self, dir: &Path, op_id: Option<&str>) {
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!("failed to discard {}: {e}", dir.display());
                return;
            }
        }
        if let Some(op) = op_id {
            if let Err(e) = self.wal.commit(op) {
                warn!("failed to complete WAL entry {op}: {e}");
            }
        }
    }

    /// Filesystem trees of `key` and its ancestors, nearest first.
    fn lower_dirs(&self, parent: Option<&str>) -> Result<Vec<PathBuf>, StoreError> {
        let mut lowers = Vec::new();
        let mut next = parent.map(str::to_owned);
        while let Some(key) = next {
            let record = self.read_record(&key)?;
            lowers.push(self.fs_path(&key));
            next = record.info.parent;
        }
        Ok(lowers)
    }

    fn mounts_for(&self, record: &SnapshotRecord) -> Result<Vec<Mount>, StoreError> {
        let key = &record.info.key;
        let readonly = record.info.kind == SnapshotKind::View;
        let own = self.fs_path(key);

        if self.mode == SnapshotterMode::Native || record.info.parent.is_none() {
            return Ok(vec![Mount::bind(own.display().to_string(), readonly)]);
        }

        let lowers = self.lower_dirs(record.info.parent.as_deref())?;
        let lowerdir = lowers
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        if readonly {
            if let [single] = lowers.as_slice() {
                return Ok(vec![Mount::bind(single.display().to_string(), true)]);
            }
            return Ok(vec![Mount {
                kind: "overlay".to_owned(),
                source: "overlay".to_owned(),
                options: vec![format!("lowerdir={lowerdir}")],
            }]);
        }

        let work = self.layout.snapshot_dir(key).join(WORK_DIR);
        Ok(vec![Mount {
            kind: "overlay".to_owned(),
            source: "overlay".to_owned(),
            options: vec![
                format!("workdir={}", work.display()),
                format!("upperdir={}", own.display()),
                format!("lowerdir={lowerdir}"),
            ],
        }])
    }

    fn count_children(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self
            .records()?
            .iter()
            .filter(|r| r.info.parent.as_deref() == Some(key))
            .count())
    }

    /// Uncommitted snapshots whose owning process is gone.
    pub fn stale(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        let held = self.lease_table()?;
        let mut stale = Vec::new();
        for record in self.records()? {
            if record.info.kind == SnapshotKind::Committed || held.contains_key(&record.info.key)
            {
                continue;
            }
            let lease = self.layout.snapshot_dir(&record.info.key).join(LEASE_FILE);
            if ViewLease::is_free(&lease)? {
                stale.push(record.info);
            }
        }
        Ok(stale)
    }

    /// Roll back WAL entries left behind by processes that no longer run.
    /// Returns the number of entries rolled back.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let held = self.lease_table()?;
        self.wal.recover_where(|entry| {
            if held.contains_key(&entry.subject) {
                return false;
            }
            let lease = self.layout.snapshot_dir(&entry.subject).join(LEASE_FILE);
            ViewLease::is_free(&lease).unwrap_or(false)
        })
    }

    /// Remove directories left in `tmp/` by interrupted removals.
    pub(crate) fn sweep_tmp(&self) -> Result<usize, StoreError> {
        let tmp = self.layout.tmp_dir();
        if !tmp.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&tmp)? {
            let path = entry?.path();
            let is_removal = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("removing-"));
            if is_removal && path.is_dir() {
                fs::remove_dir_all(&path)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

impl Snapshotter for LocalSnapshotter {
    fn name(&self) -> &str {
        self.mode.as_str()
    }

    fn stat(&self, key: &str) -> Result<SnapshotInfo, StoreError> {
        Ok(self.read_record(key)?.info)
    }

    fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: &Labels,
    ) -> Result<Vec<Mount>, StoreError> {
        self.create(key, parent, labels, SnapshotKind::Active)
    }

    fn view(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: &Labels,
    ) -> Result<Vec<Mount>, StoreError> {
        self.create(key, parent, labels, SnapshotKind::View)
    }

    fn mounts(&self, key: &str) -> Result<Vec<Mount>, StoreError> {
        let record = self.read_record(key)?;
        if record.info.kind == SnapshotKind::Committed {
            return Err(StoreError::FailedPrecondition(format!(
                "snapshot '{key}' is committed and has no mounts"
            )));
        }
        self.mounts_for(&record)
    }

    fn commit(&self, name: &str, key: &str, labels: &Labels) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let mut record = self.read_record(key)?;
        if record.info.kind != SnapshotKind::Active {
            return Err(StoreError::SnapshotNotFound(format!(
                "{key} is not an active snapshot"
            )));
        }
        let src = self.layout.snapshot_dir(key);
        let dest = self.layout.snapshot_dir(name);
        if dest.exists() {
            return Err(StoreError::AlreadyExists(name.to_owned()));
        }

        let original = record.clone();
        let op_id = record.wal_op.take();
        record.info.key = name.to_owned();
        record.info.kind = SnapshotKind::Committed;
        record
            .info
            .labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        record.info.updated_at = chrono::Utc::now().to_rfc3339();
        self.write_record(&src, &record)?;

        if let Err(e) = fs::rename(&src, &dest) {
            // Put the active record back so the caller can still remove it.
            if let Err(restore) = self.write_record(&src, &original) {
                warn!("failed to restore record of {key}: {restore}");
            }
            return Err(e.into());
        }
        crate::fsync_dir(&self.layout.snapshots_dir())?;

        if let Err(e) = fs::remove_file(dest.join(LEASE_FILE)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to drop lease of {name}: {e}");
            }
        }
        if self.mode == SnapshotterMode::Overlay {
            if let Err(e) = fs::remove_dir_all(dest.join(WORK_DIR)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to delete work dir of {name}: {e}");
                }
            }
        }
        self.lease_table()?.remove(key);
        if let Some(op) = op_id {
            self.wal.commit(&op)?;
        }
        debug!("committed {key} as {name}");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let record = self.read_record(key)?;
        if record.info.kind == SnapshotKind::Committed {
            let children = self.count_children(key)?;
            if children > 0 {
                return Err(StoreError::HasDependents {
                    key: key.to_owned(),
                    children,
                });
            }
        }

        // Rename out of the namespace first so the snapshot disappears
        // atomically even if deleting the tree is interrupted.
        let dir = self.layout.snapshot_dir(key);
        let tmp = self.layout.tmp_dir();
        fs::create_dir_all(&tmp)?;
        let doomed = tmp.join(format!(
            "removing-{}",
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        if doomed.exists() {
            fs::remove_dir_all(&doomed)?;
        }
        fs::rename(&dir, &doomed)?;
        crate::fsync_dir(&self.layout.snapshots_dir())?;

        self.lease_table()?.remove(key);
        if let Some(op) = &record.wal_op {
            self.wal.commit(op)?;
        }
        if let Err(e) = fs::remove_dir_all(&doomed) {
            warn!("failed to delete {}: {e}", doomed.display());
        }
        debug!("removed {} snapshot {key}", record.info.kind);
        Ok(())
    }

    fn list(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        Ok(self.records()?.into_iter().map(|r| r.info).collect())
    }
}

/// Recursively copy a filesystem tree, preserving symlinks, permissions,
/// owners and modification times.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = from.symlink_metadata()?;
        let ft = meta.file_type();

        if ft.is_dir() {
            copy_tree(&from, &to)?;
        } else if ft.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if ft.is_file() {
            fs::copy(&from, &to)?;
        } else {
            warn!("skipping unsupported file type: {}", from.display());
            continue;
        }
        copy_attributes(&meta, &to)?;
    }
    Ok(())
}

/// Owner first, since chown clears set-id bits, then mode, then mtime.
fn copy_attributes(meta: &fs::Metadata, to: &Path) -> Result<(), StoreError> {
    let current = to.symlink_metadata()?;
    if current.uid() != meta.uid() || current.gid() != meta.gid() {
        std::os::unix::fs::lchown(to, Some(meta.uid()), Some(meta.gid()))?;
    }
    if !meta.file_type().is_symlink() {
        fs::set_permissions(to, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    set_mtime_nofollow(to, meta.mtime(), meta.mtime_nsec())
}

#[allow(unsafe_code)]
fn set_mtime_nofollow(path: &Path, secs: i64, nsecs: i64) -> Result<(), StoreError> {
    let c = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        StoreError::InvalidContent(format!("path contains NUL byte: {}", path.display()))
    })?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: secs,
            tv_nsec: nsecs,
        },
    ];
    // SAFETY: `c` is NUL-terminated and `times` holds the two entries
    // utimensat reads; neither pointer is retained past the call.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}
