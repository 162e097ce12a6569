//! Standard filesystem paths for Wraptor.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default directory for downloaded source files.
pub static WRAPTOR_CACHE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("WRAPTOR_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.wraptor/caches"))
});

/// Standard paths used by Wraptor.
#[derive(Debug, Clone)]
pub struct WrapPaths {
    /// Cache directory for downloaded sources.
    pub cache: PathBuf,
    /// Home directory, used to locate registry credentials.
    pub home: PathBuf,
}

impl WrapPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom cache directory.
    #[must_use]
    pub fn with_cache(cache: impl Into<PathBuf>) -> Self {
        Self {
            cache: cache.into(),
            ..Self::default()
        }
    }

    /// Docker-compatible credentials file (`~/.docker/config.json`).
    #[must_use]
    pub fn docker_config(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return PathBuf::from(dir).join("config.json");
        }
        self.home.join(".docker").join("config.json")
    }
}

impl Default for WrapPaths {
    fn default() -> Self {
        Self {
            cache: WRAPTOR_CACHE_DIR.clone(),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_cache() {
        let paths = WrapPaths::with_cache("/tmp/wraptor-test");
        assert_eq!(paths.cache, PathBuf::from("/tmp/wraptor-test"));
        assert!(paths.docker_config().ends_with("config.json"));
    }
}
