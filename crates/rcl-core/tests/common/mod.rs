#![allow(dead_code)]
//! Scratch stores, layer tarballs and OCI layouts shared by the integration tests.

use rcl_core::LayerApplier;
use rcl_schema::{media_types, Descriptor, Digest, ANNOTATION_REF_NAME};
use rcl_store::{
    ContentSource, ContentStore, ImageStore, LocalSnapshotter, SnapshotKind, Snapshotter,
    SnapshotterMode, StoreLayout,
};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

pub enum Entry<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
}

pub fn tar_layer(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            Entry::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                builder.append_data(&mut header, path, *data).unwrap();
            }
            Entry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
            Entry::Symlink(path, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                header.set_link_name(target).unwrap();
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// A fresh store with every component wired to the same root.
pub struct TestStore {
    pub dir: tempfile::TempDir,
    pub layout: StoreLayout,
    pub content: Arc<ContentStore>,
    pub images: ImageStore,
    pub snapshotter: LocalSnapshotter,
    pub applier: LayerApplier,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir)
    }

    pub fn with_mode(mode: SnapshotterMode) -> Self {
        let mut store = Self::new();
        store.snapshotter = LocalSnapshotter::new(store.layout.clone(), mode);
        store
    }

    pub fn open(dir: tempfile::TempDir) -> Self {
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let content = Arc::new(ContentStore::new(layout.clone()));
        let source: Arc<dyn ContentSource> = content.clone();
        Self {
            images: ImageStore::new(layout.clone()),
            snapshotter: LocalSnapshotter::new(layout.clone(), SnapshotterMode::Native),
            applier: LayerApplier::new(source, layout.tmp_dir()),
            content,
            layout,
            dir,
        }
    }

    /// Store `blob` and describe it as a layer of `media_type`.
    pub fn add_layer(&self, blob: &[u8], media_type: &str) -> Descriptor {
        let digest = self.content.put(blob).unwrap();
        Descriptor::new(media_type, digest, blob.len() as u64)
    }

    pub fn committed(&self) -> Vec<String> {
        self.snapshotter
            .list()
            .unwrap()
            .into_iter()
            .filter(|s| s.kind == SnapshotKind::Committed)
            .map(|s| s.key)
            .collect()
    }

    pub fn uncommitted(&self) -> Vec<String> {
        self.snapshotter
            .list()
            .unwrap()
            .into_iter()
            .filter(|s| s.kind != SnapshotKind::Committed)
            .map(|s| s.key)
            .collect()
    }

    pub fn rootfs(&self, chain_id: &Digest) -> std::path::PathBuf {
        self.snapshotter.fs_path(chain_id.as_str())
    }
}

fn write_blob(dir: &Path, data: &[u8]) -> Descriptor {
    let digest = Digest::sha256(data);
    let path = dir.join("blobs").join("sha256").join(digest.hex());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, data).unwrap();
    Descriptor::new("", digest, data.len() as u64)
}

/// Write a single-manifest OCI image layout and return the manifest descriptor.
pub fn write_oci_layout(
    dir: &Path,
    layers: &[(Vec<u8>, &str)],
    os: &str,
    architecture: &str,
    ref_name: Option<&str>,
) -> Descriptor {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    let layer_descs: Vec<serde_json::Value> = layers
        .iter()
        .map(|(blob, media)| {
            let d = write_blob(dir, blob);
            serde_json::json!({"mediaType": media, "digest": d.digest, "size": d.size})
        })
        .collect();
    let diff_ids: Vec<String> = layers
        .iter()
        .map(|(blob, _)| Digest::sha256(blob).to_string())
        .collect();
    let config = serde_json::to_vec(&serde_json::json!({
        "architecture": architecture,
        "os": os,
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
    }))
    .unwrap();
    let config_desc = write_blob(dir, &config);

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_MANIFEST,
        "config": {
            "mediaType": media_types::OCI_CONFIG,
            "digest": config_desc.digest,
            "size": config_desc.size,
        },
        "layers": layer_descs,
    }))
    .unwrap();
    let manifest_desc = write_blob(dir, &manifest);
    let mut entry = serde_json::json!({
        "mediaType": media_types::OCI_MANIFEST,
        "digest": manifest_desc.digest,
        "size": manifest_desc.size,
        "platform": {"os": os, "architecture": architecture},
    });
    if let Some(name) = ref_name {
        entry["annotations"] = serde_json::json!({ ANNOTATION_REF_NAME: name });
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_INDEX,
        "manifests": [entry],
    });
    fs::write(dir.join("index.json"), serde_json::to_vec_pretty(&index).unwrap()).unwrap();

    Descriptor::new(
        media_types::OCI_MANIFEST,
        manifest_desc.digest,
        manifest_desc.size,
    )
}
