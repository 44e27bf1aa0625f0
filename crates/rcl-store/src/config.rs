use crate::layout::StoreLayout;
use crate::StoreError;
use rcl_schema::Platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::str::FromStr;

/// How the local snapshotter materializes snapshots on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotterMode {
    /// Every snapshot is a full copy of its parent plus its own diff.
    #[default]
    Native,
    /// Snapshots hold only their diff and are stacked with overlayfs.
    Overlay,
}

impl SnapshotterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotterMode::Native => "native",
            SnapshotterMode::Overlay => "overlay",
        }
    }
}

impl fmt::Display for SnapshotterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(SnapshotterMode::Native),
            "overlay" => Ok(SnapshotterMode::Overlay),
            other => Err(format!(
                "unknown snapshotter '{other}', expected 'native' or 'overlay'"
            )),
        }
    }
}

/// Store-wide settings read from `<root>/rcl.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub snapshotter: SnapshotterMode,
    /// Target platform for unpacking. Defaults to the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl StoreConfig {
    pub fn parse(content: &str) -> Result<Self, StoreError> {
        toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Load `rcl.toml` from the store root, or the defaults if it is absent.
    pub fn load_or_default(layout: &StoreLayout) -> Result<Self, StoreError> {
        let path = layout.config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn save(&self, layout: &StoreLayout) -> Result<(), StoreError> {
        let content = toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        crate::write_atomic(layout.root(), &layout.config_file(), content.as_bytes())
    }

    /// The configured platform, or the host platform.
    pub fn target_platform(&self) -> Platform {
        match &self.platform {
            Some(p) => Platform::new(&p.os, &p.architecture, p.variant.as_deref()).normalize(),
            None => Platform::host(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let cfg = StoreConfig::parse("").unwrap();
        assert_eq!(cfg.snapshotter, SnapshotterMode::Native);
        assert!(cfg.platform.is_none());
        assert_eq!(cfg.target_platform(), Platform::host());
    }

    #[test]
    fn parse_full_config() {
        let cfg = StoreConfig::parse(
            r#"
snapshotter = "overlay"

[platform]
os = "linux"
architecture = "aarch64"
"#,
        )
        .unwrap();
        assert_eq!(cfg.snapshotter, SnapshotterMode::Overlay);
        assert_eq!(cfg.target_platform().to_string(), "linux/arm64");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StoreConfig::parse("compression = true").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn unknown_snapshotter_is_rejected() {
        assert!(StoreConfig::parse(r#"snapshotter = "zfs""#).is_err());
        assert!("zfs".parse::<SnapshotterMode>().is_err());
        assert_eq!(
            "overlay".parse::<SnapshotterMode>().unwrap(),
            SnapshotterMode::Overlay
        );
    }

    #[test]
    fn missing_file_yields_defaults_and_save_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        assert_eq!(
            StoreConfig::load_or_default(&layout).unwrap(),
            StoreConfig::default()
        );

        let cfg = StoreConfig {
            snapshotter: SnapshotterMode::Overlay,
            platform: Some(PlatformConfig {
                os: "linux".to_owned(),
                architecture: "arm".to_owned(),
                variant: Some("v6".to_owned()),
            }),
        };
        cfg.save(&layout).unwrap();
        assert_eq!(StoreConfig::load_or_default(&layout).unwrap(), cfg);
    }
}
