//! Image reference parsing.

use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use wraptor_common::{WrapError, WrapResult};

static REGISTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*|\[[0-9a-fA-F:]+\])(?::[0-9]+)?$")
        .expect("registry pattern is valid")
});

static COMPONENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("component pattern is valid")
});

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern is valid"));

static DIGEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").expect("digest pattern is valid")
});

const MAX_REPOSITORY_LEN: usize = 255;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (with port, if any).
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageTag {
    /// The tag or digest as it appears in registry URLs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(t) | Self::Digest(t) => t,
        }
    }
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";
    /// API host serving the default registry.
    pub const DOCKER_HUB_API: &'static str = "registry-1.docker.io";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    /// - `localhost:5000/app@sha256:...` -> digest reference
    pub fn parse(reference: &str) -> WrapResult<Self> {
        if reference.is_empty() {
            return Err(WrapError::reference(reference, "reference is empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(WrapError::reference(reference, "reference contains whitespace"));
        }

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            if !DIGEST_RE.is_match(digest) {
                return Err(WrapError::reference(reference, format!("invalid digest '{digest}'")));
            }
            // A tag next to the digest is allowed but ignored.
            let name = strip_tag(name).0;
            (name, ImageTag::Digest(digest.to_string()))
        } else {
            match strip_tag(reference) {
                (name, Some(tag)) => {
                    if !TAG_RE.is_match(tag) {
                        return Err(WrapError::reference(reference, format!("invalid tag '{tag}'")));
                    }
                    (name, ImageTag::Tag(tag.to_string()))
                }
                (name, None) => (name, ImageTag::Tag(Self::DEFAULT_TAG.to_string())),
            }
        };

        // Parse registry and repository
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (Self::DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        let registry = match registry.as_str() {
            "index.docker.io" | "registry-1.docker.io" => Self::DEFAULT_REGISTRY.to_string(),
            _ => registry,
        };
        let repository = if registry == Self::DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if !REGISTRY_RE.is_match(&registry) {
            return Err(WrapError::reference(reference, format!("invalid registry '{registry}'")));
        }
        if repository.is_empty() || repository.len() > MAX_REPOSITORY_LEN {
            return Err(WrapError::reference(reference, "repository name has an invalid length"));
        }
        if let Some(bad) = repository.split('/').find(|c| !COMPONENT_RE.is_match(c)) {
            return Err(WrapError::reference(
                reference,
                format!("invalid repository component '{bad}'"),
            ));
        }

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Parse a reference that must name a tag, not a digest.
    pub fn parse_tag(reference: &str) -> WrapResult<Self> {
        let parsed = Self::parse(reference)?;
        if matches!(parsed.reference, ImageTag::Digest(_)) {
            return Err(WrapError::reference(
                reference,
                "a tag is required, digest references cannot be loaded",
            ));
        }
        Ok(parsed)
    }

    /// Host serving the registry API.
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == Self::DEFAULT_REGISTRY {
            Self::DOCKER_HUB_API
        } else {
            &self.registry
        }
    }

    /// Whether the registry should be reached over plain HTTP.
    #[must_use]
    pub fn is_insecure(&self) -> bool {
        let host = self
            .registry
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map_or(self.registry.as_str(), |(host, _)| host);
        if matches!(host, "localhost" | "127.0.0.1" | "[::1]") {
            return true;
        }
        std::env::var("WRAPTOR_INSECURE_REGISTRIES")
            .map(|list| list.split(',').any(|r| r.trim() == self.registry))
            .unwrap_or(false)
    }

    /// Base URL of the registry API (`scheme://host`).
    #[must_use]
    pub fn api_base_url(&self) -> String {
        let scheme = if self.is_insecure() { "http" } else { "https" };
        format!("{scheme}://{}", self.api_host())
    }

    /// Name as the local daemon reports it (`alpine:latest` for Docker Hub
    /// official images).
    #[must_use]
    pub fn daemon_name(&self) -> String {
        let name = if self.registry == Self::DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        match &self.reference {
            ImageTag::Tag(t) => format!("{name}:{t}"),
            ImageTag::Digest(d) => format!("{name}@{d}"),
        }
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

/// Split `name[:tag]`, ignoring a `:` that belongs to a registry port.
fn strip_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rfind(':') {
        Some(idx) if !reference[idx + 1..].contains('/') => {
            (&reference[..idx], Some(&reference[idx + 1..]))
        }
        _ => (reference, None),
    }
}

impl FromStr for ImageReference {
    type Err = WrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
