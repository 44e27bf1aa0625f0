use crate::config::StoreConfig;
use crate::content::ContentStore;
use crate::images::ImageStore;
use crate::layout::StoreLayout;
use crate::local::LocalSnapshotter;
use crate::lock::GcLock;
use crate::snapshot::{SnapshotInfo, SnapshotKind, Snapshotter};
use crate::StoreError;
use rcl_schema::{media_types, parse_index, parse_manifest, Digest};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Content label prefix marking a snapshot as referenced by a blob.
pub const GC_SNAPSHOT_LABEL_PREFIX: &str = "containerd.io/gc.ref.snapshot.";

pub struct GarbageCollector {
    layout: StoreLayout,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub orphaned_snapshots: Vec<String>,
    pub stale_views: Vec<String>,
    pub orphaned_blobs: Vec<String>,
    pub removed_snapshots: usize,
    pub removed_views: usize,
    pub removed_blobs: usize,
}

impl GarbageCollector {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn collect(&self, dry_run: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(dry_run, || false)
    }

    /// Mark everything reachable from the image catalogue, then sweep the rest.
    ///
    /// Blobs are live when an image reaches them through its index or
    /// manifest. Snapshots are live when a live blob names them through a
    /// `containerd.io/gc.ref.snapshot.*` label, when they are an ancestor
    /// of a live snapshot, or when a running process still leases a child.
    ///
    /// Waits for running unpacks and imports to finish, and keeps new ones
    /// out until the sweep is done.
    pub fn collect_with_cancel(
        &self,
        dry_run: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let _gc = GcLock::exclusive(&self.layout.gc_lock_file())?;
        let config = StoreConfig::load_or_default(&self.layout)?;
        let snapshotter = LocalSnapshotter::new(self.layout.clone(), config.snapshotter);
        let content = ContentStore::new(self.layout.clone());
        let images = ImageStore::new(self.layout.clone());

        let mut report = GcReport::default();

        let live_blobs = self.mark_blobs(&content, &images)?;
        let all_blobs = content.list()?;
        for digest in &all_blobs {
            if !live_blobs.contains(digest) {
                report.orphaned_blobs.push(digest.to_string());
            }
        }

        let snapshots = snapshotter.list()?;
        let by_key: HashMap<&str, &SnapshotInfo> =
            snapshots.iter().map(|s| (s.key.as_str(), s)).collect();
        let stale: HashSet<String> = snapshotter.stale()?.into_iter().map(|s| s.key).collect();

        let mut roots: Vec<String> = Vec::new();
        for digest in &live_blobs {
            if !content.exists(digest) {
                continue;
            }
            for (k, v) in content.labels(digest)? {
                if k.starts_with(GC_SNAPSHOT_LABEL_PREFIX) {
                    roots.push(v);
                }
            }
        }
        for s in &snapshots {
            if s.kind != SnapshotKind::Committed && !stale.contains(&s.key) {
                roots.push(s.key.clone());
            }
        }

        let mut live_snapshots: HashSet<String> = HashSet::new();
        for root in roots {
            let mut next = Some(root);
            while let Some(key) = next {
                if !live_snapshots.insert(key.clone()) {
                    break;
                }
                next = by_key.get(key.as_str()).and_then(|s| s.parent.clone());
            }
        }

        let depth = |key: &str| {
            let mut d = 0usize;
            let mut next = by_key.get(key).and_then(|s| s.parent.as_deref());
            while let Some(p) = next {
                d += 1;
                next = by_key.get(p).and_then(|s| s.parent.as_deref());
            }
            d
        };
        let mut orphans: Vec<&SnapshotInfo> = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Committed && !live_snapshots.contains(&s.key))
            .collect();
        // Leaves first, so every removal finds its snapshot childless.
        orphans.sort_by_key(|s| std::cmp::Reverse(depth(&s.key)));
        report.orphaned_snapshots = orphans.iter().map(|s| s.key.clone()).collect();
        report.stale_views = snapshots
            .iter()
            .filter(|s| stale.contains(&s.key))
            .map(|s| s.key.clone())
            .collect();

        if !dry_run {
            for key in &report.stale_views {
                if should_stop() {
                    return Ok(report);
                }
                match snapshotter.remove(key) {
                    Ok(()) => report.removed_views += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }

            for key in &report.orphaned_snapshots {
                if should_stop() {
                    return Ok(report);
                }
                match snapshotter.remove(key) {
                    Ok(()) => report.removed_snapshots += 1,
                    Err(e) if e.is_not_found() => {}
                    // A builder stacked a new snapshot on it since marking.
                    Err(StoreError::HasDependents { .. }) => {
                        warn!("gc: keeping {key}, it gained dependents");
                    }
                    Err(e) => return Err(e),
                }
            }

            for hex in &report.orphaned_blobs {
                if should_stop() {
                    return Ok(report);
                }
                let digest = Digest::parse(hex)
                    .map_err(|e| StoreError::InvalidContent(e.to_string()))?;
                match content.remove(&digest) {
                    Ok(()) => report.removed_blobs += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }

            let swept = snapshotter.sweep_tmp()?;
            if swept > 0 {
                debug!("gc: swept {swept} interrupted removals");
            }
        }

        Ok(report)
    }

    /// Digests reachable from any image record.
    fn mark_blobs(
        &self,
        content: &ContentStore,
        images: &ImageStore,
    ) -> Result<HashSet<Digest>, StoreError> {
        let mut live = HashSet::new();
        let mut pending: Vec<(String, Digest)> = images
            .list()?
            .into_iter()
            .map(|r| (r.target.media_type, r.target.digest))
            .collect();

        while let Some((media_type, digest)) = pending.pop() {
            if !live.insert(digest.clone()) || !content.exists(&digest) {
                continue;
            }
            if media_types::is_index(&media_type) {
                let data = content.get(&digest)?;
                match parse_index(&data) {
                    Ok(index) => pending.extend(
                        index
                            .manifests
                            .into_iter()
                            .map(|d| (d.media_type, d.digest)),
                    ),
                    Err(e) => warn!("gc: unreadable index {digest}: {e}"),
                }
            } else if media_types::is_manifest(&media_type) {
                let data = content.get(&digest)?;
                match parse_manifest(&data) {
                    Ok(manifest) => {
                        pending.push((manifest.config.media_type, manifest.config.digest));
                        pending.extend(
                            manifest
                                .layers
                                .into_iter()
                                .map(|d| (d.media_type, d.digest)),
                        );
                    }
                    Err(e) => warn!("gc: unreadable manifest {digest}: {e}"),
                }
            }
        }
        Ok(live)
    }
}
