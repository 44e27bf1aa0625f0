use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A single rollback step that can undo part of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Remove a directory tree (e.g. an uncommitted snapshot directory).
    RemoveDir(PathBuf),
}

/// The type of mutating operation being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOpKind {
    Prepare,
    View,
}

impl std::fmt::Display for WalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalOpKind::Prepare => write!(f, "prepare"),
            WalOpKind::View => write!(f, "view"),
        }
    }
}

/// A WAL entry representing an in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub kind: WalOpKind,
    /// Snapshot key the operation works on.
    pub subject: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

static OP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write-ahead log for crash recovery.
///
/// Snapshot operations create a WAL entry before touching the filesystem,
/// append rollback steps as side effects occur, and remove the entry on
/// successful completion. Incomplete entries are rolled back by `recover`.
pub struct WriteAheadLog {
    wal_dir: PathBuf,
}

impl WriteAheadLog {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            wal_dir: layout.wal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        Ok(())
    }

    /// Begin a new WAL entry for an operation. Returns the op_id.
    pub fn begin(&self, kind: WalOpKind, subject: &str) -> Result<String, StoreError> {
        let seq = OP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let salt = format!("{subject}\0{}\0{seq}", std::process::id());
        let op_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%6f"),
            &blake3::hash(salt.as_bytes()).to_hex()[..12]
        );
        let entry = WalEntry {
            op_id: op_id.clone(),
            kind,
            subject: subject.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("WAL begin: {} for {subject} (op_id={op_id})", entry.kind);
        Ok(op_id)
    }

    /// Append a rollback step to an existing WAL entry.
    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)?;
        Ok(())
    }

    /// Commit (remove) a WAL entry after successful completion.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("WAL commit: {op_id}");
        }
        Ok(())
    }

    /// List all incomplete WAL entries, oldest first.
    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.wal_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt WAL entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back all incomplete WAL entries.
    pub fn recover(&self) -> Result<usize, StoreError> {
        self.recover_where(|_| true)
    }

    /// Roll back the incomplete entries accepted by `filter`, leaving the
    /// rest in place. Returns the number of entries rolled back.
    pub fn recover_where(&self, filter: impl Fn(&WalEntry) -> bool) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let mut count = 0;
        for entry in entries.iter().filter(|e| filter(e)) {
            info!(
                "WAL recovery: rolling back {} on {} (op_id={})",
                entry.kind, entry.subject, entry.op_id
            );
            rollback_entry(entry);
            let _ = fs::remove_file(self.entry_path(&entry.op_id));
            count += 1;
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        crate::write_atomic(
            &self.wal_dir,
            &self.entry_path(&entry.op_id),
            content.as_bytes(),
        )
    }

    fn read_entry(&self, op_id: &str) -> Result<WalEntry, StoreError> {
        let content = fs::read_to_string(self.entry_path(op_id))?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn rollback_entry(entry: &WalEntry) {
    // Undo side effects in reverse order.
    for step in entry.rollback_steps.iter().rev() {
        match step {
            RollbackStep::RemoveDir(path) => {
                if path.exists() {
                    if let Err(e) = fs::remove_dir_all(path) {
                        warn!("WAL rollback: failed to remove dir {}: {e}", path.display());
                    } else {
                        debug!("WAL rollback: removed dir {}", path.display());
                    }
                }
            }
        }
    }
}
