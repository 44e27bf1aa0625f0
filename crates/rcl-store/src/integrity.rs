use crate::content::ContentStore;
use crate::images::ImageStore;
use crate::layout::StoreLayout;
use crate::local::LocalSnapshotter;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub blobs_checked: usize,
    pub blobs_passed: usize,
    pub snapshots_checked: usize,
    pub snapshots_passed: usize,
    pub images_checked: usize,
    pub images_passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub subject: String,
    pub reason: String,
}

/// Re-hash every blob and verify every snapshot and image record checksum.
///
/// Failures are collected rather than returned so a single bad entry does
/// not hide the state of the rest of the store.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let content = ContentStore::new(layout.clone());
    let images = ImageStore::new(layout.clone());
    // The mode only affects mounts, which verification never computes.
    let snapshotter = LocalSnapshotter::new(layout.clone(), crate::SnapshotterMode::default());

    let mut report = IntegrityReport::default();

    for digest in content.list()? {
        report.blobs_checked += 1;
        let blob = content.verify(&digest);
        let labels = content.labels(&digest).map(|_| ());
        match blob.and(labels) {
            Ok(()) => report.blobs_passed += 1,
            Err(StoreError::IntegrityFailure { key, actual, .. }) => {
                report.failed.push(IntegrityFailure {
                    subject: digest.to_string(),
                    reason: format!("{key}: checksum mismatch, got {actual}"),
                });
            }
            Err(e) => report.failed.push(IntegrityFailure {
                subject: digest.to_string(),
                reason: format!("blob read error: {e}"),
            }),
        }
    }

    for (path, loaded) in snapshotter.scan()? {
        report.snapshots_checked += 1;
        let subject = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let checked = loaded.and_then(|r| {
            if path == layout.snapshot_dir(&r.info.key) {
                Ok(())
            } else {
                Err(StoreError::InvalidContent(format!(
                    "record key '{}' does not match its directory",
                    r.info.key
                )))
            }
        });
        match checked {
            Ok(()) => report.snapshots_passed += 1,
            Err(StoreError::IntegrityFailure { actual, .. }) => {
                report.failed.push(IntegrityFailure {
                    subject,
                    reason: format!("snapshot record checksum mismatch: got {actual}"),
                });
            }
            Err(StoreError::SnapshotNotFound(_)) => report.failed.push(IntegrityFailure {
                subject,
                reason: "snapshot directory has no record".to_owned(),
            }),
            Err(e) => report.failed.push(IntegrityFailure {
                subject,
                reason: format!("snapshot record error: {e}"),
            }),
        }
    }

    let (records, errors) = images.list_with_errors()?;
    report.images_checked = records.len() + errors.len();
    report.images_passed = records.len();
    for (path, e) in errors {
        report.failed.push(IntegrityFailure {
            subject: path.display().to_string(),
            reason: format!("image record error: {e}"),
        });
    }

    Ok(report)
}
