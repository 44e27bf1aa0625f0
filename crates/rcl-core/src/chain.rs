use crate::apply::Applier;
use crate::CoreError;
use rcl_schema::{chain_id, chain_ids, Descriptor, Digest};
use rcl_store::{Labels, Mount, Snapshotter, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Label recording which layer digest a committed snapshot added.
pub const SNAPSHOT_LAYER_LABEL: &str = "rcl.io/snapshot.layer";

/// Prepare attempts per layer before a key collision is treated as fatal.
const MAX_KEY_ATTEMPTS: usize = 16;

static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of [`ChainBuilder::apply_layers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Chain ID of the full sequence, `None` for an empty one.
    pub chain_id: Option<Digest>,
    /// Layers this call extracted and committed, root first.
    pub applied: Vec<Digest>,
}

enum Step {
    Built(bool),
    ParentMissing,
}

/// Builds committed snapshots for layer sequences.
///
/// Snapshots are keyed by chain ID, so equal sequences share one snapshot and
/// a sequence that is already present costs a single `stat`. Missing
/// ancestors are built on demand. Concurrent builders of the same chain are
/// resolved by the snapshotter: whoever commits first wins and the others
/// discard their views and report success.
pub struct ChainBuilder<'a> {
    snapshotter: &'a dyn Snapshotter,
    applier: &'a dyn Applier,
    should_stop: Box<dyn Fn() -> bool + Send + Sync + 'a>,
    labels: Labels,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(snapshotter: &'a dyn Snapshotter, applier: &'a dyn Applier) -> Self {
        Self {
            snapshotter,
            applier,
            should_stop: Box::new(|| false),
            labels: Labels::new(),
        }
    }

    /// Poll `should_stop` before each prepare and after each apply.
    #[must_use]
    pub fn with_cancel(mut self, should_stop: impl Fn() -> bool + Send + Sync + 'a) -> Self {
        self.should_stop = Box::new(should_stop);
        self
    }

    /// Extra labels passed to every prepare and commit.
    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Ensure a committed snapshot exists for the whole `layers` sequence.
    pub fn apply_layers(&self, layers: &[Descriptor]) -> Result<ApplyReport, CoreError> {
        let diffs: Vec<Digest> = layers.iter().map(|l| l.digest.clone()).collect();
        let ids = chain_ids(&diffs);
        let Some(target) = ids.last() else {
            return Ok(ApplyReport {
                chain_id: None,
                applied: Vec::new(),
            });
        };

        let mut applied = Vec::new();
        if self.exists(target)? {
            debug!("chain {target} already present");
            return Ok(ApplyReport {
                chain_id: Some(target.clone()),
                applied,
            });
        }

        // Each entry is (prefix length, may build its parent). A level
        // descends at most once, so the loop is bounded by 2 * layers.len().
        let mut work: Vec<(usize, bool)> = vec![(layers.len(), true)];
        while let Some(&(n, can_descend)) = work.last() {
            let parent = n.checked_sub(2).map(|i| ids[i].as_str());
            match self.build_one(&layers[n - 1], &ids[n - 1], parent, can_descend && n > 1)? {
                Step::Built(did_apply) => {
                    if did_apply {
                        applied.push(layers[n - 1].digest.clone());
                    }
                    work.pop();
                }
                Step::ParentMissing => {
                    debug!("parent of {} missing, building {} first", ids[n - 1], ids[n - 2]);
                    if let Some(top) = work.last_mut() {
                        top.1 = false;
                    }
                    work.push((n - 1, true));
                }
            }
        }

        Ok(ApplyReport {
            chain_id: Some(target.clone()),
            applied,
        })
    }

    /// Apply one layer on top of the existing chain `chain_so_far`.
    ///
    /// Returns whether this call did the work. The parent must already be
    /// committed: with a single descriptor there is nothing to rebuild it from.
    pub fn apply_layer(
        &self,
        layer: &Descriptor,
        chain_so_far: &[Digest],
    ) -> Result<bool, CoreError> {
        let parent = chain_id(chain_so_far);
        let mut diffs = chain_so_far.to_vec();
        diffs.push(layer.digest.clone());
        let Some(target) = chain_id(&diffs) else {
            return Ok(false);
        };
        if self.exists(&target)? {
            return Ok(false);
        }
        match self.build_one(layer, &target, parent.as_ref().map(Digest::as_str), false)? {
            Step::Built(did_apply) => Ok(did_apply),
            Step::ParentMissing => {
                let parent = parent.map(String::from).unwrap_or_default();
                Err(CoreError::Snapshot {
                    key: parent.clone(),
                    source: StoreError::SnapshotNotFound(parent),
                })
            }
        }
    }

    fn exists(&self, chain_id: &Digest) -> Result<bool, CoreError> {
        match self.snapshotter.stat(chain_id.as_str()) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(source) => Err(CoreError::Snapshot {
                key: chain_id.to_string(),
                source,
            }),
        }
    }

    fn build_one(
        &self,
        layer: &Descriptor,
        chain_id: &Digest,
        parent: Option<&str>,
        can_descend: bool,
    ) -> Result<Step, CoreError> {
        let mut attempts = 0;
        let (key, mounts) = loop {
            if (self.should_stop)() {
                return Err(CoreError::Cancelled);
            }
            let key = build_key(chain_id);
            match self.snapshotter.prepare(&key, parent, &self.labels) {
                Ok(mounts) => break (key, mounts),
                Err(e) if e.is_not_found() && can_descend => return Ok(Step::ParentMissing),
                Err(e) if e.is_already_exists() && attempts + 1 < MAX_KEY_ATTEMPTS => {
                    attempts += 1;
                    debug!("build key {key} taken, retrying");
                }
                Err(source) => return Err(CoreError::Snapshot { key, source }),
            }
        };

        debug!("extracting {} into {key}", layer.digest);
        let result = self.apply_and_commit(layer, chain_id, &key, &mounts);
        if !matches!(result, Ok(true)) {
            if let Err(e) = self.discard(&key) {
                warn!("{e}");
            }
        }
        result.map(Step::Built)
    }

    fn apply_and_commit(
        &self,
        layer: &Descriptor,
        chain_id: &Digest,
        key: &str,
        mounts: &[Mount],
    ) -> Result<bool, CoreError> {
        let applied = self.applier.apply(layer, mounts)?;
        if (self.should_stop)() {
            return Err(CoreError::Cancelled);
        }
        if applied.digest != layer.digest {
            return Err(CoreError::Integrity {
                layer: layer.digest.to_string(),
                expected: layer.digest.to_string(),
                actual: applied.digest.to_string(),
            });
        }

        let mut labels = self.labels.clone();
        labels.insert(SNAPSHOT_LAYER_LABEL.to_owned(), layer.digest.to_string());
        match self.snapshotter.commit(chain_id.as_str(), key, &labels) {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                debug!("{chain_id} committed concurrently, dropping {key}");
                Ok(false)
            }
            Err(source) => Err(CoreError::Snapshot {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Remove a build view. A view that is already gone is not an error.
    fn discard(&self, key: &str) -> Result<(), CoreError> {
        match self.snapshotter.remove(key) {
            Err(e) if !e.is_not_found() => Err(CoreError::Cleanup {
                key: key.to_owned(),
                source: e,
            }),
            _ => Ok(()),
        }
    }
}

/// A key no other attempt, in this process or another, will produce.
fn build_key(chain_id: &Digest) -> String {
    let now = chrono::Utc::now();
    let n = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}\0{}\0{n}",
        now.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id()
    );
    let hash = blake3::hash(seed.as_bytes()).to_hex();
    format!(
        "extract-{}-{} {chain_id}",
        now.format("%Y%m%d%H%M%S%9f"),
        &hash[..12]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcl_schema::media_types;
    use rcl_store::{SnapshotInfo, SnapshotKind};
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    /// In-memory snapshotter recording calls.
    #[derive(Default)]
    struct FakeSnapshotter {
        committed: Mutex<HashSet<String>>,
        active: Mutex<BTreeMap<String, Option<String>>>,
        calls: Mutex<Vec<String>>,
        fail_remove: bool,
    }

    impl FakeSnapshotter {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
        fn count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
        fn info(key: &str, kind: SnapshotKind) -> SnapshotInfo {
            SnapshotInfo {
                key: key.to_owned(),
                kind,
                parent: None,
                labels: Labels::new(),
                created_at: String::new(),
                updated_at: String::new(),
            }
        }
    }

    impl Snapshotter for FakeSnapshotter {
        fn name(&self) -> &str {
            "fake"
        }
        fn stat(&self, key: &str) -> Result<SnapshotInfo, StoreError> {
            self.log(format!("stat {key}"));
            if self.committed.lock().unwrap().contains(key) {
                Ok(Self::info(key, SnapshotKind::Committed))
            } else {
                Err(StoreError::SnapshotNotFound(key.to_owned()))
            }
        }
        fn prepare(
            &self,
            key: &str,
            parent: Option<&str>,
            _: &Labels,
        ) -> Result<Vec<Mount>, StoreError> {
            self.log(format!("prepare {key}"));
            if let Some(p) = parent {
                if !self.committed.lock().unwrap().contains(p) {
                    return Err(StoreError::SnapshotNotFound(p.to_owned()));
                }
            }
            self.active
                .lock()
                .unwrap()
                .insert(key.to_owned(), parent.map(String::from));
            Ok(vec![Mount::bind("/nonexistent", false)])
        }
        fn view(
            &self,
            key: &str,
            parent: Option<&str>,
            labels: &Labels,
        ) -> Result<Vec<Mount>, StoreError> {
            self.prepare(key, parent, labels)
        }
        fn mounts(&self, _: &str) -> Result<Vec<Mount>, StoreError> {
            Ok(Vec::new())
        }
        fn commit(&self, name: &str, key: &str, _: &Labels) -> Result<(), StoreError> {
            self.log(format!("commit {name}"));
            if self.active.lock().unwrap().remove(key).is_none() {
                return Err(StoreError::SnapshotNotFound(key.to_owned()));
            }
            if !self.committed.lock().unwrap().insert(name.to_owned()) {
                self.active.lock().unwrap().insert(key.to_owned(), None);
                return Err(StoreError::AlreadyExists(name.to_owned()));
            }
            Ok(())
        }
        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.log(format!("remove {key}"));
            if self.fail_remove {
                return Err(StoreError::LockFailed("remove refused".to_owned()));
            }
            self.active
                .lock()
                .unwrap()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| StoreError::SnapshotNotFound(key.to_owned()))
        }
        fn list(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Applier that echoes the descriptor, or corrupts it when asked.
    #[derive(Default)]
    struct FakeApplier {
        corrupt: bool,
        applied: Mutex<Vec<Digest>>,
    }

    impl Applier for FakeApplier {
        fn apply(&self, desc: &Descriptor, _: &[Mount]) -> Result<Descriptor, CoreError> {
            self.applied.lock().unwrap().push(desc.digest.clone());
            let mut out = desc.clone();
            if self.corrupt {
                out.digest = Digest::sha256(b"something else");
            }
            Ok(out)
        }
    }

    fn layer(data: &[u8]) -> Descriptor {
        Descriptor::new(media_types::OCI_LAYER, Digest::sha256(data), data.len() as u64)
    }

    #[test]
    fn empty_sequence_has_no_chain() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier::default();
        let report = ChainBuilder::new(&sn, &ap).apply_layers(&[]).unwrap();
        assert_eq!(report.chain_id, None);
        assert!(sn.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn builds_every_prefix_root_first() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier::default();
        let layers = [layer(b"a"), layer(b"b"), layer(b"c")];
        let report = ChainBuilder::new(&sn, &ap).apply_layers(&layers).unwrap();

        let digests: Vec<Digest> = layers.iter().map(|l| l.digest.clone()).collect();
        assert_eq!(report.chain_id, chain_id(&digests));
        assert_eq!(report.applied, digests);
        for id in chain_ids(&digests) {
            assert!(sn.committed.lock().unwrap().contains(id.as_str()));
        }
        assert!(sn.active.lock().unwrap().is_empty());
    }

    #[test]
    fn present_chain_costs_one_stat() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier::default();
        let layers = [layer(b"a"), layer(b"b")];
        let builder = ChainBuilder::new(&sn, &ap);
        builder.apply_layers(&layers).unwrap();
        sn.calls.lock().unwrap().clear();

        let report = builder.apply_layers(&layers).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(*sn.calls.lock().unwrap(), vec![format!("stat {}", report.chain_id.unwrap())]);
    }

    #[test]
    fn integrity_violation_discards_view_and_commits_nothing() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier {
            corrupt: true,
            ..Default::default()
        };
        let err = ChainBuilder::new(&sn, &ap)
            .apply_layers(&[layer(b"a")])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IntegrityViolation);
        assert!(sn.committed.lock().unwrap().is_empty());
        assert!(sn.active.lock().unwrap().is_empty());
        assert_eq!(sn.count("remove "), 1);
    }

    #[test]
    fn cleanup_failure_does_not_replace_the_error() {
        let sn = FakeSnapshotter {
            fail_remove: true,
            ..Default::default()
        };
        let ap = FakeApplier {
            corrupt: true,
            ..Default::default()
        };
        let err = ChainBuilder::new(&sn, &ap)
            .apply_layers(&[layer(b"a")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Integrity { .. }));

        let cleanup = ChainBuilder::new(&sn, &ap).discard("extract-1 x").unwrap_err();
        assert_eq!(cleanup.kind(), crate::ErrorKind::Cleanup);
        assert!(cleanup.to_string().contains("extract-1 x"));
    }

    #[test]
    fn apply_layer_requires_parent() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier::default();
        let err = ChainBuilder::new(&sn, &ap)
            .apply_layer(&layer(b"b"), &[Digest::sha256(b"a")])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert!(ap.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn apply_layer_reports_whether_work_was_done() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier::default();
        let builder = ChainBuilder::new(&sn, &ap);
        assert!(builder.apply_layer(&layer(b"a"), &[]).unwrap());
        assert!(!builder.apply_layer(&layer(b"a"), &[]).unwrap());
        assert!(builder
            .apply_layer(&layer(b"b"), &[Digest::sha256(b"a")])
            .unwrap());
    }

    #[test]
    fn cancellation_before_prepare() {
        let sn = FakeSnapshotter::default();
        let ap = FakeApplier::default();
        let err = ChainBuilder::new(&sn, &ap)
            .with_cancel(|| true)
            .apply_layers(&[layer(b"a")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(sn.count("prepare "), 0);
    }

    #[test]
    fn build_keys_are_unique_and_name_the_chain() {
        let id = Digest::sha256(b"x");
        let a = build_key(&id);
        let b = build_key(&id);
        assert_ne!(a, b);
        assert!(a.starts_with("extract-"));
        assert!(a.ends_with(&format!(" {id}")));
    }
}
