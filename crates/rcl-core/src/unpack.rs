use crate::apply::Applier;
use crate::chain::ChainBuilder;
use crate::CoreError;
use rcl_schema::{
    chain_id, media_types, parse_config, parse_index, parse_manifest, Descriptor, Digest,
    ImageManifest, ManifestError, Platform,
};
use rcl_store::{ContentStore, GcLock, ImageStore, Snapshotter, GC_SNAPSHOT_LABEL_PREFIX};
use tracing::{debug, info};

/// Content label recording that a layer blob was verified by extraction.
pub const UNCOMPRESSED_LABEL: &str = "containerd.io/uncompressed";

/// Index levels followed before a target is rejected.
const MAX_INDEX_DEPTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Refuse images whose config declares a platform the target does not accept.
    pub check_platform_supported: bool,
}

#[derive(Debug, Clone)]
pub struct UnpackReport {
    pub image: String,
    /// Chain ID of the image's rootfs snapshot.
    pub chain_id: Digest,
    /// Layers extracted by this call; empty when already unpacked.
    pub applied: Vec<Digest>,
    pub layers: usize,
}

/// Unpacks catalogued images into snapshots.
pub struct Unpacker<'a> {
    content: &'a ContentStore,
    images: &'a ImageStore,
    snapshotter: &'a dyn Snapshotter,
    applier: &'a dyn Applier,
    platform: Platform,
    should_stop: Box<dyn Fn() -> bool + Send + Sync + 'a>,
}

impl<'a> Unpacker<'a> {
    pub fn new(
        content: &'a ContentStore,
        images: &'a ImageStore,
        snapshotter: &'a dyn Snapshotter,
        applier: &'a dyn Applier,
    ) -> Self {
        Self {
            content,
            images,
            snapshotter,
            applier,
            platform: Platform::host(),
            should_stop: Box::new(|| false),
        }
    }

    /// Platform used to pick manifests out of indexes. Defaults to the host.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform.normalize();
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, should_stop: impl Fn() -> bool + Send + Sync + 'a) -> Self {
        self.should_stop = Box::new(should_stop);
        self
    }

    fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>, CoreError> {
        self.content
            .get(&desc.digest)
            .map_err(|source| CoreError::Fetch {
                digest: desc.digest.to_string(),
                source,
            })
    }

    /// Follow indexes down to the platform's manifest.
    fn resolve(&self, target: &Descriptor) -> Result<ImageManifest, CoreError> {
        let mut desc = target.clone();
        for _ in 0..=MAX_INDEX_DEPTH {
            if media_types::is_manifest(&desc.media_type) {
                return Ok(parse_manifest(&self.read_blob(&desc)?)?);
            }
            if !media_types::is_index(&desc.media_type) {
                return Err(ManifestError::UnexpectedMediaType {
                    expected: media_types::OCI_MANIFEST.to_owned(),
                    found: desc.media_type.clone(),
                }
                .into());
            }
            let index = parse_index(&self.read_blob(&desc)?)?;
            let next = index.select(&self.platform)?.clone();
            debug!("{} resolved to {} for {}", desc.digest, next.digest, self.platform);
            desc = next;
        }
        Err(CoreError::Unsupported {
            digest: target.digest.to_string(),
            reason: format!("more than {MAX_INDEX_DEPTH} nested indexes"),
        })
    }

    /// The manifest an image resolves to on this unpacker's platform.
    pub fn manifest(&self, image: &str) -> Result<ImageManifest, CoreError> {
        let record = self.images.get(image)?;
        self.resolve(&record.target)
    }

    /// Layer digests making up the image's rootfs, root first.
    pub fn rootfs(&self, image: &str) -> Result<Vec<Digest>, CoreError> {
        Ok(self.manifest(image)?.layer_digests())
    }

    /// Whether the image's full chain is committed. Performs a single stat.
    pub fn is_unpacked(&self, image: &str) -> Result<bool, CoreError> {
        let Some(id) = chain_id(&self.rootfs(image)?) else {
            return Ok(false);
        };
        match self.snapshotter.stat(id.as_str()) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(source) => Err(CoreError::Snapshot {
                key: id.to_string(),
                source,
            }),
        }
    }

    fn check_platform(&self, manifest: &ImageManifest) -> Result<(), CoreError> {
        let config = parse_config(&self.read_blob(&manifest.config)?)?;
        let declared = Platform::new(&config.os, &config.architecture, None).normalize();
        if self.platform.matches(&declared) {
            return Ok(());
        }
        Err(CoreError::UnsupportedPlatform(format!(
            "snapshotter {} does not support platform {declared} for image {}",
            self.snapshotter.name(),
            manifest.config.digest
        )))
    }

    /// Build the image's rootfs snapshot chain and tag the content store.
    ///
    /// Garbage collection is held off until the rootfs label is written.
    pub fn unpack(&self, image: &str, opts: &UnpackOptions) -> Result<UnpackReport, CoreError> {
        let _gc = GcLock::shared(&self.content.layout().gc_lock_file())?;
        let manifest = self.manifest(image)?;
        if opts.check_platform_supported {
            self.check_platform(&manifest)?;
        }

        let builder = ChainBuilder::new(self.snapshotter, self.applier)
            .with_cancel(|| (self.should_stop)());
        let report = builder.apply_layers(&manifest.layers)?;
        let rootfs = report
            .chain_id
            .ok_or(CoreError::Manifest(ManifestError::NoLayers))?;

        for digest in &report.applied {
            self.content
                .set_label(digest, UNCOMPRESSED_LABEL, digest.as_str())?;
        }
        let gc_label = format!("{GC_SNAPSHOT_LABEL_PREFIX}{}", self.snapshotter.name());
        self.content
            .set_label(&manifest.config.digest, &gc_label, rootfs.as_str())?;

        info!(
            "unpacked {image}: {} of {} layer(s) applied, rootfs {rootfs}",
            report.applied.len(),
            manifest.layers.len()
        );
        Ok(UnpackReport {
            image: image.to_owned(),
            chain_id: rootfs,
            applied: report.applied,
            layers: manifest.layers.len(),
        })
    }
}
