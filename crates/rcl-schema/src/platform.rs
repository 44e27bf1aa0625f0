//! Target platform descriptors and the normalization used for matching.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            architecture: architecture.to_owned(),
            os: os.to_owned(),
            os_version: None,
            variant: variant.map(str::to_owned),
        }
    }

    /// The platform this process runs on, normalized.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH, None).normalize()
    }

    /// Canonical form: lowercase OS, Go-style architecture names, and the
    /// default variant rules (`arm64/v8` drops its variant, bare `arm` is `v7`).
    #[must_use]
    pub fn normalize(&self) -> Self {
        let os = self.os.to_lowercase();
        let variant = self.variant.as_deref().map(str::to_lowercase);
        let (architecture, variant) = match self.architecture.to_lowercase().as_str() {
            "i386" => ("386".to_owned(), None),
            "x86_64" | "x86-64" | "amd64" => {
                let v = variant.filter(|v| v != "v1");
                ("amd64".to_owned(), v)
            }
            "aarch64" | "arm64" => {
                let v = variant.filter(|v| v != "8" && v != "v8");
                ("arm64".to_owned(), v)
            }
            "armhf" => ("arm".to_owned(), Some("v7".to_owned())),
            "armel" => ("arm".to_owned(), Some("v6".to_owned())),
            "arm" => {
                let v = match variant.as_deref() {
                    None | Some("" | "7") => "v7".to_owned(),
                    Some(n @ ("5" | "6" | "8")) => format!("v{n}"),
                    Some(other) => other.to_owned(),
                };
                ("arm".to_owned(), Some(v))
            }
            other => (other.to_owned(), variant),
        };
        Self {
            architecture,
            os,
            os_version: self.os_version.clone(),
            variant: variant.filter(|v| !v.is_empty()),
        }
    }

    /// Whether `candidate` satisfies this (requested) platform. A request
    /// without a variant accepts any variant of the same architecture.
    pub fn matches(&self, candidate: &Platform) -> bool {
        let want = self.normalize();
        let have = candidate.normalize();
        want.os == have.os
            && want.architecture == have.architecture
            && (self.variant.is_none() || want.variant == have.variant)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = String;

    /// Parse `os/arch[/variant]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(os, arch, None)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => {
                Ok(Self::new(os, arch, Some(variant)))
            }
            _ => Err(format!("invalid platform '{s}', expected os/arch[/variant]")),
        }
    }
}
