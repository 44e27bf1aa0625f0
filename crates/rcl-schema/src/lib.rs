//! Content addressing, chain identity, and OCI image schema for rcl.
//!
//! This crate defines the schema layer: validated algorithm-qualified
//! digests (`Digest`), streaming hashing (`Digester`), OCI descriptors and
//! media types, deterministic chain-ID computation (`chain_id`), image
//! manifest/index parsing with validation, and platform normalization and
//! matching.

pub mod descriptor;
pub mod digest;
pub mod identity;
pub mod manifest;
pub mod platform;
pub mod types;

pub use descriptor::{media_types, Descriptor, LayerFormat, ANNOTATION_REF_NAME, ANNOTATION_TITLE};
pub use digest::{Algorithm, Digest, DigestError, Digester};
pub use identity::{chain_id, chain_ids};
pub use manifest::{
    parse_config, parse_index, parse_manifest, ImageConfig, ImageIndex, ImageManifest,
    ManifestError, RootFs,
};
pub use platform::Platform;
pub use types::ImageName;
