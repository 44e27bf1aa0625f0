use crate::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

/// Exclusive advisory lock over store metadata mutations.
///
/// Held only for short critical sections (key allocation, commit renames,
/// removals). Layer extraction never runs under it.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, StoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Reader/writer lock separating garbage collection from writers.
///
/// Unpacks and imports hold it shared for their whole run, so snapshots
/// and blobs they have created but not yet referenced stay invisible to a
/// collector, which holds it exclusively from mark to sweep. It lives in its
/// own file: store operations take [`StoreLock`] internally, and `flock`
/// conflicts between descriptors even within one process.
pub struct GcLock {
    lock_file: File,
}

impl GcLock {
    pub fn shared(lock_path: &Path) -> Result<Self, StoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_shared()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;
        Ok(Self { lock_file: file })
    }

    pub fn exclusive(lock_path: &Path) -> Result<Self, StoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_exclusive(lock_path: &Path) -> Result<Option<Self>, StoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for GcLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Proof that the current process owns an in-flight snapshot.
///
/// The lease is an exclusive `flock` on a file inside the snapshot
/// directory. The kernel drops it when the owning process dies, which is how
/// recovery tells a crashed build from one still running.
pub struct ViewLease {
    lock_file: File,
}

impl ViewLease {
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Whether no live process holds the lease at `path`.
    pub fn is_free(path: &Path) -> Result<bool, StoreError> {
        if !path.exists() {
            return Ok(true);
        }
        Ok(Self::try_acquire(path)?.is_some())
    }
}

impl Drop for ViewLease {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        {
            let _lock = StoreLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
            assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
        }

        let _lock2 = StoreLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn gc_lock_readers_share_and_exclude_the_collector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.lock");

        let a = GcLock::shared(&path).unwrap();
        let b = GcLock::shared(&path).unwrap();
        assert!(GcLock::try_exclusive(&path).unwrap().is_none());
        drop(a);
        assert!(GcLock::try_exclusive(&path).unwrap().is_none());
        drop(b);
        let collector = GcLock::try_exclusive(&path).unwrap();
        assert!(collector.is_some());
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease");

        let lease = ViewLease::try_acquire(&path).unwrap().unwrap();
        assert!(!ViewLease::is_free(&path).unwrap());
        drop(lease);
        assert!(ViewLease::is_free(&path).unwrap());
    }

    #[test]
    fn missing_lease_file_is_free() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ViewLease::is_free(&dir.path().join("absent")).unwrap());
        assert!(!dir.path().join("absent").exists());
    }
}
