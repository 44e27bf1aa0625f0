//! Import of OCI image-layout directories (`oci-layout`, `index.json`,
//! `blobs/<alg>/<hex>`) into the content store and image catalogue.

use crate::CoreError;
use rcl_schema::{
    media_types, parse_index, parse_manifest, Descriptor, ImageName, ANNOTATION_REF_NAME,
};
use rcl_store::{ContentStore, GcLock, ImageRecord, ImageStore, StoreError};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Image names created or updated, sorted.
    pub images: Vec<String>,
    /// Blobs copied into the store; already-present blobs are not counted.
    pub blobs: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

fn check_layout_version(dir: &Path) -> Result<(), CoreError> {
    let path = dir.join("oci-layout");
    if !path.exists() {
        return Ok(());
    }
    let marker: LayoutMarker = serde_json::from_slice(&fs::read(&path)?)?;
    if marker.image_layout_version.starts_with("1.") {
        Ok(())
    } else {
        Err(CoreError::Unsupported {
            digest: path.display().to_string(),
            reason: format!(
                "image layout version {} is not supported",
                marker.image_layout_version
            ),
        })
    }
}

/// Copy every blob reachable from `roots` out of the layout directory.
fn ingest_closure(dir: &Path, content: &ContentStore, roots: Vec<Descriptor>) -> Result<usize, CoreError> {
    let mut seen = HashSet::new();
    let mut pending = roots;
    let mut copied = 0;

    while let Some(desc) = pending.pop() {
        if !seen.insert(desc.digest.clone()) {
            continue;
        }
        if !content.exists(&desc.digest) {
            let path = dir
                .join("blobs")
                .join(desc.digest.algorithm().as_str())
                .join(desc.digest.hex());
            let mut file = File::open(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => CoreError::Fetch {
                    digest: desc.digest.to_string(),
                    source: StoreError::BlobNotFound(path.display().to_string()),
                },
                _ => CoreError::Io(e),
            })?;
            content.ingest(&mut file, &desc).map_err(|source| CoreError::Fetch {
                digest: desc.digest.to_string(),
                source,
            })?;
            copied += 1;
        }

        if media_types::is_index(&desc.media_type) {
            let index = parse_index(&content.get(&desc.digest)?)?;
            pending.extend(index.manifests);
        } else if media_types::is_manifest(&desc.media_type) {
            let manifest = parse_manifest(&content.get(&desc.digest)?)?;
            pending.push(manifest.config);
            pending.extend(manifest.layers);
        }
    }
    Ok(copied)
}

/// Import an OCI image layout.
///
/// With `name`, the whole `index.json` becomes that one image and platform
/// selection happens at unpack time. Without it, every index entry carrying
/// an `org.opencontainers.image.ref.name` annotation becomes an image of
/// that name.
pub fn import_oci_layout(
    dir: &Path,
    content: &ContentStore,
    images: &ImageStore,
    name: Option<&str>,
) -> Result<ImportReport, CoreError> {
    check_layout_version(dir)?;
    let _gc = GcLock::shared(&content.layout().gc_lock_file())?;
    let index_bytes = fs::read(dir.join("index.json"))?;
    let index = parse_index(&index_bytes)?;

    let targets: Vec<(String, Descriptor)> = match name {
        Some(name) => {
            let digest = content.put(&index_bytes)?;
            let desc = Descriptor::new(media_types::OCI_INDEX, digest, index_bytes.len() as u64);
            vec![(name.to_owned(), desc)]
        }
        None => index
            .manifests
            .iter()
            .filter_map(|d| {
                d.annotations
                    .get(ANNOTATION_REF_NAME)
                    .map(|n| (n.clone(), d.clone()))
            })
            .collect(),
    };
    if targets.is_empty() {
        return Err(CoreError::Unsupported {
            digest: dir.join("index.json").display().to_string(),
            reason: format!("no entry carries {ANNOTATION_REF_NAME}; give the image a name"),
        });
    }

    let blobs = ingest_closure(
        dir,
        content,
        targets.iter().map(|(_, d)| d.clone()).collect(),
    )?;

    let mut names = Vec::with_capacity(targets.len());
    for (name, target) in targets {
        debug!("image {name} -> {}", target.digest);
        images.put(&ImageRecord::new(ImageName::new(name.clone()), target))?;
        names.push(name);
    }
    names.sort();
    names.dedup();

    info!(
        "imported {} image(s) from {} ({blobs} new blob(s))",
        names.len(),
        dir.display()
    );
    Ok(ImportReport {
        images: names,
        blobs,
    })
}
