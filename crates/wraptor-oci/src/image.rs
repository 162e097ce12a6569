//! OCI Image Specification types.
//!
//! Based on the OCI Image Specification v1.1.0:
//! <https://github.com/opencontainers/image-spec>
//!
//! Maps are ordered so that serializing a document twice yields the same
//! bytes, and therefore the same digest. Fields this crate does not model are
//! kept in `extra` so that a base image's documents survive a round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OCI Image Manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type of the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor.
    pub config: Descriptor,
    /// Image layers.
    pub layers: Vec<Descriptor>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Whether this manifest uses the Docker v2 schema 2 media types.
    #[must_use]
    pub fn is_docker(&self) -> bool {
        self.media_type.as_deref() == Some(media_types::DOCKER_MANIFEST)
    }

    /// Media type to use for layers appended to this manifest.
    #[must_use]
    pub fn layer_media_type(&self) -> &'static str {
        if self.is_docker() {
            media_types::DOCKER_LAYER
        } else {
            media_types::LAYER_TAR_GZIP
        }
    }
}

/// OCI Image Index (multi-architecture manifest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Manifest list.
    pub manifests: Vec<ManifestDescriptor>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// An index with no manifests.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::INDEX.to_string()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Find the manifest matching the given platform.
    #[must_use]
    pub fn find_platform(&self, platform: &Platform) -> Option<&ManifestDescriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.matches(platform))
        })
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size in bytes.
    pub size: i64,
    /// URLs for downloading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor without URLs or annotations.
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Manifest descriptor with platform information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform for linux/amd64.
    #[must_use]
    pub fn linux_amd64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }

    /// Create a platform for linux/arm64.
    #[must_use]
    pub fn linux_arm64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
            variant: Some("v8".to_string()),
        }
    }

    /// Parse `os/arch[/variant]`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('/');
        let os = parts.next().filter(|s| !s.is_empty())?;
        let architecture = parts.next().filter(|s| !s.is_empty())?;
        let variant = parts.next().map(String::from);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant,
        })
    }

    /// Whether `self` (from an index) satisfies the wanted platform.
    ///
    /// A missing variant on the wanted side matches any variant.
    #[must_use]
    pub fn matches(&self, wanted: &Self) -> bool {
        self.os == wanted.os
            && self.architecture == wanted.architecture
            && (wanted.variant.is_none() || self.variant == wanted.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::linux_amd64()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// OCI Image Configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Execution parameters, kept verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// Rootfs information.
    #[serde(default)]
    pub rootfs: RootFs,
    /// History entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageConfig {
    /// Configuration of an image with no layers for the given platform.
    #[must_use]
    pub fn empty(platform: &Platform) -> Self {
        Self {
            created: None,
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            config: Some(Value::Object(Map::new())),
            rootfs: RootFs::default(),
            history: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Root filesystem information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Type (must be "layers").
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Layer diff IDs (uncompressed digests).
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// History entry for an image layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Command that created this layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Whether this is an empty layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// Common media types.
pub mod media_types {
    /// OCI image manifest media type.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index media type.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image config media type.
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// OCI layer media type (tar+gzip).
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    /// OCI layer media type (uncompressed tar).
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

    /// Docker manifest v2 schema 2 media type.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest list media type.
    pub const DOCKER_INDEX: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Docker image config media type.
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    /// Docker layer media type.
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Whether the media type names an index or manifest list.
    #[must_use]
    pub fn is_index(media_type: &str) -> bool {
        media_type == INDEX || media_type == DOCKER_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serialization() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_string()),
            config: Descriptor::new(media_types::CONFIG, "sha256:abc123", 1024),
            layers: vec![Descriptor::new(
                media_types::LAYER_TAR_GZIP,
                "sha256:layer1",
                10240,
            )],
            annotations: BTreeMap::new(),
        };

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("schemaVersion"));
        assert!(json.contains("sha256:abc123"));
        assert!(!json.contains("annotations"));
        assert_eq!(manifest.layer_media_type(), media_types::LAYER_TAR_GZIP);
    }

    #[test]
    fn config_keeps_unknown_fields() {
        let raw = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/bin"], "Cmd": ["sh"]},
            "container_config": {"Hostname": "abc"},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aaa"]},
            "docker_version": "20.10.7"
        }"#;
        let config: ImageConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:aaa"]);
        assert!(config.extra.contains_key("container_config"));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["docker_version"], "20.10.7");
        assert_eq!(back["config"]["Cmd"][0], "sh");
    }

    #[test]
    fn platform_matching() {
        let amd64 = Platform::linux_amd64();
        assert_eq!(amd64.to_string(), "linux/amd64");
        assert_eq!(Platform::parse("linux/arm64/v8"), Some(Platform::linux_arm64()));
        assert_eq!(Platform::parse("linux"), None);

        let wanted = Platform::parse("linux/arm64").unwrap();
        assert!(Platform::linux_arm64().matches(&wanted));
        assert!(!amd64.matches(&wanted));
    }

    #[test]
    fn index_lookup() {
        let index = ImageIndex {
            manifests: vec![
                ManifestDescriptor {
                    descriptor: Descriptor::new(media_types::MANIFEST, "sha256:arm", 10),
                    platform: Some(Platform::linux_arm64()),
                },
                ManifestDescriptor {
                    descriptor: Descriptor::new(media_types::MANIFEST, "sha256:amd", 10),
                    platform: Some(Platform::linux_amd64()),
                },
            ],
            ..ImageIndex::empty()
        };
        let found = index.find_platform(&Platform::linux_amd64()).unwrap();
        assert_eq!(found.descriptor.digest, "sha256:amd");
    }
}
