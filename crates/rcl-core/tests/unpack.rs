//! Import an OCI layout and unpack it end to end.

mod common;

use common::{gzip, tar_layer, write_oci_layout, Entry, TestStore};
use rcl_core::{import_oci_layout, ErrorKind, UnpackOptions, Unpacker, UNCOMPRESSED_LABEL};
use rcl_schema::{chain_id, media_types, Platform};
use rcl_store::{Snapshotter, GC_SNAPSHOT_LABEL_PREFIX};
use std::fs;

struct Image {
    store: TestStore,
    layers: Vec<Vec<u8>>,
}

fn imported(os: &str, arch: &str) -> Image {
    let store = TestStore::new();
    let a = tar_layer(&[
        Entry::Dir("etc"),
        Entry::File("etc/hostname", b"base\n"),
        Entry::File("etc/remove-me", b"x"),
    ]);
    let b = gzip(&tar_layer(&[
        Entry::File("etc/hostname", b"app\n"),
        Entry::File("etc/.wh.remove-me", b""),
    ]));
    let layout = store.dir.path().join("layout");
    write_oci_layout(
        &layout,
        &[
            (a.clone(), media_types::OCI_LAYER),
            (b.clone(), media_types::OCI_LAYER_GZIP),
        ],
        os,
        arch,
        Some("example.com/app:1.0"),
    );
    let report = import_oci_layout(&layout, &store.content, &store.images, None).unwrap();
    assert_eq!(report.images, vec!["example.com/app:1.0"]);
    assert_eq!(report.blobs, 4);
    Image {
        store,
        layers: vec![a, b],
    }
}

fn unpacker(store: &TestStore) -> Unpacker<'_> {
    Unpacker::new(&store.content, &store.images, &store.snapshotter, &store.applier)
        .with_platform(Platform::new("linux", "amd64", None))
}

#[test]
fn unpack_creates_both_prefix_snapshots() {
    let img = imported("linux", "amd64");
    let store = &img.store;
    let unpacker = unpacker(store);
    assert!(!unpacker.is_unpacked("example.com/app:1.0").unwrap());

    let report = unpacker
        .unpack("example.com/app:1.0", &UnpackOptions::default())
        .unwrap();

    let digests = unpacker.rootfs("example.com/app:1.0").unwrap();
    assert_eq!(digests.len(), 2);
    assert_eq!(report.applied, digests);
    assert_eq!(Some(report.chain_id.clone()), chain_id(&digests));

    // [h1] and [h1, h2] both exist.
    assert!(store.snapshotter.stat(digests[0].as_str()).is_ok());
    assert!(store.snapshotter.stat(report.chain_id.as_str()).is_ok());
    assert!(unpacker.is_unpacked("example.com/app:1.0").unwrap());

    let root = store.rootfs(&report.chain_id);
    assert_eq!(fs::read(root.join("etc/hostname")).unwrap(), b"app\n");
    assert!(!root.join("etc/remove-me").exists());
    let base = store.rootfs(&digests[0]);
    assert_eq!(fs::read(base.join("etc/hostname")).unwrap(), b"base\n");
}

#[test]
fn unpack_labels_layers_and_config() {
    let img = imported("linux", "amd64");
    let store = &img.store;
    let unpacker = unpacker(store);
    let report = unpacker
        .unpack("example.com/app:1.0", &UnpackOptions::default())
        .unwrap();

    for digest in &report.applied {
        let labels = store.content.labels(digest).unwrap();
        assert_eq!(labels.get(UNCOMPRESSED_LABEL), Some(&digest.to_string()));
    }
    let manifest = unpacker.manifest("example.com/app:1.0").unwrap();
    let labels = store.content.labels(&manifest.config.digest).unwrap();
    let key = format!("{GC_SNAPSHOT_LABEL_PREFIX}native");
    assert_eq!(labels.get(&key), Some(&report.chain_id.to_string()));
}

#[test]
fn second_unpack_applies_nothing() {
    let img = imported("linux", "amd64");
    let unpacker = unpacker(&img.store);
    let opts = UnpackOptions::default();
    let first = unpacker.unpack("example.com/app:1.0", &opts).unwrap();
    let second = unpacker.unpack("example.com/app:1.0", &opts).unwrap();
    assert_eq!(first.chain_id, second.chain_id);
    assert!(second.applied.is_empty());
    assert_eq!(second.layers, 2);
}

#[test]
fn platform_check_rejects_foreign_images() {
    let img = imported("linux", "arm64");
    let unpacker = Unpacker::new(
        &img.store.content,
        &img.store.images,
        &img.store.snapshotter,
        &img.store.applier,
    )
    .with_platform(Platform::new("linux", "amd64", None));

    // The record targets the manifest directly, so only the explicit check
    // looks at the config's platform.
    let opts = UnpackOptions {
        check_platform_supported: true,
    };
    let err = unpacker.unpack("example.com/app:1.0", &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(img.store.committed().is_empty());

    let ok = unpacker
        .unpack("example.com/app:1.0", &UnpackOptions::default())
        .unwrap();
    assert_eq!(ok.layers, img.layers.len());
}

#[test]
fn named_import_selects_manifest_by_platform() {
    let store = TestStore::new();
    let layout = store.dir.path().join("layout");
    write_oci_layout(
        &layout,
        &[(tar_layer(&[Entry::File("f", b"arm")]), media_types::OCI_LAYER)],
        "linux",
        "arm64",
        None,
    );
    let report = import_oci_layout(&layout, &store.content, &store.images, Some("local/img")).unwrap();
    assert_eq!(report.images, vec!["local/img"]);

    let arm = Unpacker::new(&store.content, &store.images, &store.snapshotter, &store.applier)
        .with_platform(Platform::new("linux", "aarch64", None));
    let unpacked = arm.unpack("local/img", &UnpackOptions::default()).unwrap();
    assert_eq!(unpacked.applied.len(), 1);

    let amd = unpacker(&store);
    let err = amd.rootfs("local/img").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[test]
fn unknown_image_is_not_found() {
    let store = TestStore::new();
    let err = unpacker(&store)
        .unpack("missing:latest", &UnpackOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn import_without_names_is_rejected() {
    let store = TestStore::new();
    let layout = store.dir.path().join("layout");
    write_oci_layout(
        &layout,
        &[(tar_layer(&[Entry::File("f", b"x")]), media_types::OCI_LAYER)],
        "linux",
        "amd64",
        None,
    );
    assert!(import_oci_layout(&layout, &store.content, &store.images, None).is_err());
}

#[test]
fn import_detects_tampered_blobs() {
    let store = TestStore::new();
    let layout = store.dir.path().join("layout");
    let layer = tar_layer(&[Entry::File("f", b"x")]);
    write_oci_layout(
        &layout,
        &[(layer.clone(), media_types::OCI_LAYER)],
        "linux",
        "amd64",
        Some("t:1"),
    );
    let digest = rcl_schema::Digest::sha256(&layer);
    let path = layout.join("blobs/sha256").join(digest.hex());
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let err = import_oci_layout(&layout, &store.content, &store.images, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    assert!(!store.content.exists(&digest));
}
