use crate::descriptor::{media_types, Descriptor};
use crate::digest::Digest;
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schemaVersion: {0}, expected 2")]
    UnsupportedSchemaVersion(u32),
    #[error("unexpected media type '{found}', expected {expected}")]
    UnexpectedMediaType { expected: String, found: String },
    #[error("manifest declares no layers")]
    NoLayers,
    #[error("index has no manifest for platform {0}")]
    NoMatchingPlatform(String),
}

/// An OCI image manifest (or Docker schema 2 manifest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.schema_version != 2 {
            return Err(ManifestError::UnsupportedSchemaVersion(self.schema_version));
        }
        if let Some(mt) = &self.media_type {
            if !media_types::is_manifest(mt) {
                return Err(ManifestError::UnexpectedMediaType {
                    expected: media_types::OCI_MANIFEST.to_owned(),
                    found: mt.clone(),
                });
            }
        }
        if self.layers.is_empty() {
            return Err(ManifestError::NoLayers);
        }
        Ok(())
    }

    /// Ordered layer digests, root first.
    pub fn layer_digests(&self) -> Vec<Digest> {
        self.layers.iter().map(|l| l.digest.clone()).collect()
    }
}

/// An OCI image index (or Docker manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.schema_version != 2 {
            return Err(ManifestError::UnsupportedSchemaVersion(self.schema_version));
        }
        if let Some(mt) = &self.media_type {
            if !media_types::is_index(mt) {
                return Err(ManifestError::UnexpectedMediaType {
                    expected: media_types::OCI_INDEX.to_owned(),
                    found: mt.clone(),
                });
            }
        }
        Ok(())
    }

    /// First manifest entry matching `platform`. Entries without a platform
    /// are accepted only when nothing more specific matches.
    pub fn select(&self, platform: &Platform) -> Result<&Descriptor, ManifestError> {
        let manifests = || {
            self.manifests
                .iter()
                .filter(|d| media_types::is_manifest(&d.media_type))
        };
        manifests()
            .find(|d| d.platform.as_ref().is_some_and(|p| platform.matches(p)))
            .or_else(|| manifests().find(|d| d.platform.is_none()))
            .ok_or_else(|| ManifestError::NoMatchingPlatform(platform.to_string()))
    }
}

/// The subset of the image configuration needed for platform checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,
}

impl ImageConfig {
    pub fn platform(&self) -> Platform {
        Platform::new(&self.os, &self.architecture, self.variant.as_deref()).normalize()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<Digest>,
}

pub fn parse_manifest(data: &[u8]) -> Result<ImageManifest, ManifestError> {
    let manifest: ImageManifest = serde_json::from_slice(data)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_index(data: &[u8]) -> Result<ImageIndex, ManifestError> {
    let index: ImageIndex = serde_json::from_slice(data)?;
    index.validate()?;
    Ok(index)
}

pub fn parse_config(data: &[u8]) -> Result<ImageConfig, ManifestError> {
    Ok(serde_json::from_slice(data)?)
}
