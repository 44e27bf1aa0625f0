use crate::archive::{self, WhiteoutMode};
use crate::mount::{self, TempMount};
use crate::CoreError;
use flate2::read::GzDecoder;
use rcl_schema::{Algorithm, Descriptor, Digest, Digester, LayerFormat};
use rcl_store::{ContentSource, Mount};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Materializes one layer into a prepared snapshot.
///
/// Returns a descriptor for what was actually consumed: the digest and size
/// are computed from the bytes read, never copied from the input.
pub trait Applier: Send + Sync {
    fn apply(&self, desc: &Descriptor, mounts: &[Mount]) -> Result<Descriptor, CoreError>;
}

struct HashingReader<R> {
    inner: R,
    digester: Digester,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R, algorithm: Algorithm) -> Self {
        Self {
            inner,
            digester: Digester::new(algorithm),
        }
    }

    fn finish(self) -> (Digest, u64) {
        let size = self.digester.written();
        (self.digester.finalize(), size)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

/// Default [`Applier`]: tar layers (plain or gzip) and artifact blobs read
/// from a [`ContentSource`].
pub struct LayerApplier {
    source: Arc<dyn ContentSource>,
    scratch: PathBuf,
}

impl LayerApplier {
    /// `scratch` holds temporary mount points for the generic path.
    pub fn new(source: Arc<dyn ContentSource>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            source,
            scratch: scratch.into(),
        }
    }

    fn write_into(
        &self,
        desc: &Descriptor,
        mounts: &[Mount],
        reader: &mut dyn Read,
    ) -> Result<(), CoreError> {
        if let [m] = mounts {
            let fast = match m.kind.as_str() {
                "overlay" if !mount::running_in_userns() => mount::overlay_branches(&m.options)
                    .ok()
                    .map(|b| (b.upper, WhiteoutMode::Overlay)),
                "aufs" => mount::aufs_branches(&m.options)
                    .ok()
                    .map(|b| (b.upper, WhiteoutMode::Passthrough)),
                _ => None,
            };
            if let Some((upper, mode)) = fast {
                return write_layer(desc, &upper, mode, reader);
            }
        }
        let tmp = TempMount::new(mounts, &self.scratch)?;
        write_layer(desc, tmp.path(), WhiteoutMode::Apply, reader)
    }
}

fn apply_err(desc: &Descriptor) -> impl FnOnce(io::Error) -> CoreError + '_ {
    move |source| CoreError::Apply {
        digest: desc.digest.to_string(),
        source,
    }
}

fn write_layer(
    desc: &Descriptor,
    root: &Path,
    mode: WhiteoutMode,
    reader: &mut dyn Read,
) -> Result<(), CoreError> {
    match desc.layer_format() {
        LayerFormat::Tar => archive::extract_tar(reader, root, mode).map_err(apply_err(desc)),
        LayerFormat::TarGzip => {
            let mut gz = GzDecoder::new(reader);
            archive::extract_tar(&mut gz, root, mode).map_err(apply_err(desc))?;
            // Consume the rest of the gzip member so its trailer is checked.
            io::copy(&mut gz, &mut io::sink()).map_err(apply_err(desc))?;
            Ok(())
        }
        LayerFormat::TarZstd => Err(CoreError::Unsupported {
            digest: desc.digest.to_string(),
            reason: format!("no decompressor for {}", desc.media_type),
        }),
        LayerFormat::Artifact => {
            let title = desc.title().unwrap_or_default();
            let dest = archive::artifact_target(root, title).ok_or_else(|| {
                CoreError::Unsupported {
                    digest: desc.digest.to_string(),
                    reason: format!("artifact title '{title}' is missing or escapes the root"),
                }
            })?;
            archive::write_artifact(reader, &dest).map_err(apply_err(desc))?;
            Ok(())
        }
    }
}

impl Applier for LayerApplier {
    fn apply(&self, desc: &Descriptor, mounts: &[Mount]) -> Result<Descriptor, CoreError> {
        let start = Instant::now();
        let stream = self.source.fetch(desc).map_err(|source| CoreError::Fetch {
            digest: desc.digest.to_string(),
            source,
        })?;
        let mut reader = HashingReader::new(stream, desc.digest.algorithm());

        self.write_into(desc, mounts, &mut reader)?;
        io::copy(&mut reader, &mut io::sink()).map_err(apply_err(desc))?;

        let (digest, size) = reader.finish();
        if size != desc.size {
            return Err(apply_err(desc)(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {size} bytes, descriptor declares {}", desc.size),
            )));
        }

        debug!(
            "applied {} ({size} bytes, {}) in {:?}",
            desc.digest,
            desc.media_type,
            start.elapsed()
        );
        Ok(Descriptor {
            digest,
            size,
            ..desc.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcl_schema::{media_types, ANNOTATION_TITLE};
    use rcl_store::StoreError;
    use std::collections::HashMap;
    use std::fs;

    #[derive(Default)]
    struct MemorySource {
        blobs: HashMap<Digest, Vec<u8>>,
    }

    impl MemorySource {
        fn add(&mut self, data: Vec<u8>) -> Digest {
            let d = Digest::sha256(&data);
            self.blobs.insert(d.clone(), data);
            d
        }
    }

    impl ContentSource for MemorySource {
        fn fetch(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>, StoreError> {
            self.blobs
                .get(&desc.digest)
                .map(|b| Box::new(io::Cursor::new(b.clone())) as Box<dyn Read + Send>)
                .ok_or_else(|| StoreError::BlobNotFound(desc.digest.to_string()))
        }
    }

    fn layer_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn setup(blob: Vec<u8>) -> (tempfile::TempDir, LayerApplier, Digest, u64) {
        let dir = tempfile::tempdir().unwrap();
        let size = blob.len() as u64;
        let mut source = MemorySource::default();
        let digest = source.add(blob);
        let applier = LayerApplier::new(Arc::new(source), dir.path().join("scratch"));
        fs::create_dir(dir.path().join("fs")).unwrap();
        (dir, applier, digest, size)
    }

    fn bind(dir: &tempfile::TempDir) -> Vec<Mount> {
        vec![Mount::bind(dir.path().join("fs").display().to_string(), false)]
    }

    #[test]
    fn applies_plain_tar_and_reports_digest() {
        let (dir, applier, digest, size) = setup(layer_tar(&[("hello.txt", b"hi")]));
        let desc = Descriptor::new(media_types::OCI_LAYER, digest.clone(), size);
        let applied = applier.apply(&desc, &bind(&dir)).unwrap();
        assert_eq!(applied.digest, digest);
        assert_eq!(applied.size, size);
        assert_eq!(fs::read(dir.path().join("fs/hello.txt")).unwrap(), b"hi");
    }

    #[test]
    fn applies_gzip_layer_hashing_compressed_bytes() {
        let blob = gzip(&layer_tar(&[("a/b", b"data")]));
        let (dir, applier, digest, size) = setup(blob);
        let desc = Descriptor::new(media_types::OCI_LAYER_GZIP, digest.clone(), size);
        let applied = applier.apply(&desc, &bind(&dir)).unwrap();
        assert_eq!(applied.digest, digest);
        assert_eq!(fs::read(dir.path().join("fs/a/b")).unwrap(), b"data");
    }

    #[test]
    fn trailing_data_is_hashed() {
        let mut blob = layer_tar(&[("f", b"x")]);
        blob.extend_from_slice(&[0u8; 4096]);
        let (dir, applier, digest, size) = setup(blob);
        let desc = Descriptor::new(media_types::OCI_LAYER, digest.clone(), size);
        let applied = applier.apply(&desc, &bind(&dir)).unwrap();
        assert_eq!(applied.digest, digest);
        assert_eq!(applied.size, size);
    }

    #[test]
    fn size_mismatch_is_an_io_failure_naming_the_digest() {
        let (dir, applier, digest, size) = setup(layer_tar(&[("f", b"x")]));
        let desc = Descriptor::new(media_types::OCI_LAYER, digest.clone(), size + 1);
        let err = applier.apply(&desc, &bind(&dir)).unwrap_err();
        assert!(matches!(err, CoreError::Apply { .. }));
        assert!(err.to_string().contains(digest.as_str()));
    }

    #[test]
    fn artifact_is_written_under_its_title() {
        let (dir, applier, digest, size) = setup(b"#!/bin/sh\n".to_vec());
        let desc = Descriptor::new("application/vnd.example.script", digest.clone(), size)
            .with_annotation(ANNOTATION_TITLE, "bin/run.sh");
        let applied = applier.apply(&desc, &bind(&dir)).unwrap();
        assert_eq!(applied.digest, digest);
        assert_eq!(
            fs::read(dir.path().join("fs/bin/run.sh")).unwrap(),
            b"#!/bin/sh\n"
        );
    }

    #[test]
    fn artifact_without_title_is_unsupported() {
        let (dir, applier, digest, size) = setup(b"blob".to_vec());
        let desc = Descriptor::new("application/octet-stream", digest, size);
        let err = applier.apply(&desc, &bind(&dir)).unwrap_err();
        assert!(matches!(err, CoreError::Unsupported { .. }));
    }

    #[test]
    fn missing_blob_is_a_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let applier = LayerApplier::new(Arc::new(MemorySource::default()), dir.path());
        let desc = Descriptor::new(media_types::OCI_LAYER, Digest::sha256(b"absent"), 6);
        let err = applier.apply(&desc, &bind(&dir)).unwrap_err();
        assert!(matches!(err, CoreError::Fetch { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }

    #[test]
    fn aufs_mount_writes_into_rw_branch() {
        let (dir, applier, digest, size) = setup(layer_tar(&[("f", b"x")]));
        let upper = dir.path().join("fs");
        let mounts = vec![Mount {
            kind: "aufs".to_owned(),
            source: "none".to_owned(),
            options: vec![format!("br:{}=rw", upper.display())],
        }];
        let desc = Descriptor::new(media_types::OCI_LAYER, digest, size);
        applier.apply(&desc, &mounts).unwrap();
        assert!(upper.join("f").exists());
    }
}
