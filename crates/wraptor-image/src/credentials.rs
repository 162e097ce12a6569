//! Credential management for container registries.
//!
//! Credentials are resolved through an [`AuthProvider`]. The default chain
//! reads the Docker `config.json` (inline auths and credential helpers) and
//! falls back to environment variables:
//! - `auths` entries in `~/.docker/config.json` (or `$DOCKER_CONFIG`)
//! - `credHelpers` / `credsStore` via `docker-credential-<helper>`
//! - `WRAPTOR_REGISTRY_<HOST>_USERNAME` / `_PASSWORD` / `_TOKEN`

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use wraptor_common::{WrapError, WrapPaths, WrapResult};

/// Key Docker uses for Docker Hub in `config.json`.
const DOCKER_HUB_KEY: &str = "https://index.docker.io/v1/";

/// Registry credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Registry URL.
    pub registry: String,
    /// Username.
    pub username: String,
    /// Password or token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Identity token (for OAuth).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
}

impl Credential {
    /// Create a new credential.
    pub fn new(registry: &str, username: &str, password: &str) -> Self {
        Self {
            registry: registry.to_string(),
            username: username.to_string(),
            password: Some(password.to_string()),
            identity_token: None,
        }
    }

    /// Create with identity token (OAuth).
    pub fn with_token(registry: &str, token: &str) -> Self {
        Self {
            registry: registry.to_string(),
            username: String::new(),
            password: None,
            identity_token: Some(token.to_string()),
        }
    }

    /// Secret to present as the basic-auth password.
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.password.as_deref().or(self.identity_token.as_deref())
    }

    /// Decode from base64 auth string (Docker format).
    pub fn from_docker_auth(registry: &str, auth: &str) -> WrapResult<Self> {
        let decoded = BASE64.decode(auth).map_err(|e| WrapError::Config {
            message: format!("Invalid base64 auth: {e}"),
        })?;

        let auth_str = String::from_utf8(decoded).map_err(|e| WrapError::Config {
            message: format!("Invalid auth string: {e}"),
        })?;

        match auth_str.split_once(':') {
            Some((user, pass)) => Ok(Self::new(registry, user, pass)),
            None => Ok(Self {
                registry: registry.to_string(),
                username: auth_str,
                password: None,
                identity_token: None,
            }),
        }
    }
}

/// Resolves credentials for a registry host.
///
/// Consulted on every authenticated registry request.
pub trait AuthProvider: Send + Sync {
    /// Credentials for `registry`, or `None` for anonymous access.
    fn resolve(&self, registry: &str) -> WrapResult<Option<Credential>>;
}

/// Always anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl AuthProvider for Anonymous {
    fn resolve(&self, _registry: &str) -> WrapResult<Option<Credential>> {
        Ok(None)
    }
}

/// Keys a registry may be stored under.
///
/// Docker Hub is stored under its legacy index URL.
#[must_use]
pub fn lookup_keys(registry: &str) -> Vec<String> {
    let mut keys = vec![registry.to_string(), format!("https://{registry}")];
    if matches!(registry, "docker.io" | "index.docker.io" | "registry-1.docker.io") {
        keys.push(DOCKER_HUB_KEY.to_string());
        keys.push("index.docker.io".to_string());
    }
    keys
}

/// Server name handed to a credential helper.
fn helper_server(registry: &str) -> String {
    if lookup_keys(registry).iter().any(|k| k == DOCKER_HUB_KEY) {
        DOCKER_HUB_KEY.to_string()
    } else {
        registry.to_string()
    }
}

/// Credential store backend trait.
pub trait CredentialStore: Send + Sync {
    /// Get credential for a registry.
    fn get(&self, registry: &str) -> WrapResult<Option<Credential>>;

    /// Backend name.
    fn name(&self) -> &'static str;
}

// ==========================
// File-based Store (Docker compatible)
// ==========================

/// The parts of Docker's config.json that carry credentials. Other
/// settings are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    /// Authentication entries.
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
    /// Per-registry credential helpers.
    #[serde(default, rename = "credHelpers")]
    pub cred_helpers: HashMap<String, String>,
    /// Default credential helper.
    #[serde(default, rename = "credsStore")]
    pub creds_store: Option<String>,
}

/// Docker auth entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerAuthEntry {
    /// Base64-encoded auth string.
    #[serde(default)]
    pub auth: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Identity token.
    #[serde(default, rename = "identitytoken")]
    pub identity_token: Option<String>,
}

/// File-based credential store (Docker config.json compatible).
pub struct FileCredentialStore {
    config: DockerConfig,
}

impl FileCredentialStore {
    /// Create a new file-based store.
    pub fn new(path: impl Into<PathBuf>) -> WrapResult<Self> {
        let path = path.into();
        let config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| WrapError::Config {
                message: format!("Failed to parse {}: {e}", path.display()),
            })?
        } else {
            DockerConfig::default()
        };

        Ok(Self { config })
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn entry_credential(registry: &str, entry: &DockerAuthEntry) -> WrapResult<Option<Credential>> {
        if let Some(ref auth) = entry.auth {
            let mut cred = Credential::from_docker_auth(registry, auth)?;
            cred.identity_token.clone_from(&entry.identity_token);
            return Ok(Some(cred));
        }

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(Credential {
                registry: registry.to_string(),
                username: username.clone(),
                password: Some(password.clone()),
                identity_token: entry.identity_token.clone(),
            }));
        }

        Ok(entry
            .identity_token
            .as_deref()
            .map(|token| Credential::with_token(registry, token)))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, registry: &str) -> WrapResult<Option<Credential>> {
        for key in lookup_keys(registry) {
            if let Some(entry) = self.config.auths.get(&key) {
                if let Some(cred) = Self::entry_credential(registry, entry)? {
                    return Ok(Some(cred));
                }
            }
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ==========================
// Credential helpers (docker-credential-*)
// ==========================

/// Credentials served by `docker-credential-<helper>` programs.
pub struct HelperCredentialStore {
    helpers: HashMap<String, String>,
    default_helper: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

impl HelperCredentialStore {
    /// Build from the helper settings of a Docker config.
    #[must_use]
    pub fn from_config(config: &DockerConfig) -> Self {
        Self {
            helpers: config.cred_helpers.clone(),
            default_helper: config.creds_store.clone(),
        }
    }

    /// Whether any helper is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.helpers.is_empty() || self.default_helper.is_some()
    }

    fn helper_for(&self, registry: &str) -> Option<(&str, String)> {
        lookup_keys(registry)
            .into_iter()
            .find_map(|key| self.helpers.get(&key).map(|h| (h.as_str(), key)))
            .or_else(|| {
                self.default_helper
                    .as_deref()
                    .map(|h| (h, helper_server(registry)))
            })
    }
}

impl CredentialStore for HelperCredentialStore {
    fn get(&self, registry: &str) -> WrapResult<Option<Credential>> {
        let Some((helper, server)) = self.helper_for(registry) else {
            return Ok(None);
        };
        let program = format!("docker-credential-{helper}");

        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WrapError::Auth {
                registry: registry.to_string(),
                message: format!("Failed to run {program}: {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(server.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            // Helpers report "credentials not found" on stdout with a non-zero exit.
            tracing::debug!(
                helper,
                registry,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "Credential helper returned no credentials"
            );
            return Ok(None);
        }

        let response: HelperResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| WrapError::Auth {
                registry: registry.to_string(),
                message: format!("Invalid response from {program}: {e}"),
            })?;

        // "<token>" marks an identity token rather than a password.
        if response.username == "<token>" {
            return Ok(Some(Credential::with_token(registry, &response.secret)));
        }
        Ok(Some(Credential::new(
            registry,
            &response.username,
            &response.secret,
        )))
    }

    fn name(&self) -> &'static str {
        "helper"
    }
}

// ==========================
// Environment Variable Store
// ==========================

/// Environment variable credential store.
#[derive(Debug, Default)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    /// Create a new env store.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Variable name for a registry, e.g. `WRAPTOR_REGISTRY_GHCR_IO_TOKEN`.
    #[must_use]
    pub fn env_key(registry: &str, suffix: &str) -> String {
        let safe_registry = registry.to_uppercase().replace(['.', '/', ':', '-'], "_");
        format!("WRAPTOR_REGISTRY_{safe_registry}{suffix}")
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self, registry: &str) -> WrapResult<Option<Credential>> {
        let username = std::env::var(Self::env_key(registry, "_USERNAME")).ok();
        let password = std::env::var(Self::env_key(registry, "_PASSWORD")).ok();
        let token = std::env::var(Self::env_key(registry, "_TOKEN")).ok();

        if let Some(username) = username {
            return Ok(Some(Credential {
                registry: registry.to_string(),
                username,
                password,
                identity_token: token,
            }));
        }

        Ok(token.map(|token| Credential::with_token(registry, &token)))
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

// ==========================
// Credential Manager
// ==========================

/// Credential manager with multiple backend support.
pub struct CredentialManager {
    /// Primary store.
    primary: Box<dyn CredentialStore>,
    /// Fallback stores (checked in order).
    fallbacks: Vec<Box<dyn CredentialStore>>,
}

impl CredentialManager {
    /// Create a new credential manager with the given primary store.
    #[must_use]
    pub fn new(primary: Box<dyn CredentialStore>) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
        }
    }

    /// Docker config file, its credential helpers, then environment variables.
    pub fn default_chain(paths: &WrapPaths) -> WrapResult<Self> {
        let file_store = FileCredentialStore::new(paths.docker_config())?;
        let helpers = HelperCredentialStore::from_config(file_store.config());

        let mut manager = Self::new(Box::new(file_store));
        if helpers.is_configured() {
            manager.add_fallback(Box::new(helpers));
        }
        manager.add_fallback(Box::new(EnvCredentialStore::new()));

        Ok(manager)
    }

    /// Add a fallback store.
    pub fn add_fallback(&mut self, store: Box<dyn CredentialStore>) {
        self.fallbacks.push(store);
    }

    /// Get credential for a registry.
    pub fn get(&self, registry: &str) -> WrapResult<Option<Credential>> {
        for store in std::iter::once(&self.primary).chain(&self.fallbacks) {
            if let Some(cred) = store.get(registry)? {
                tracing::debug!(registry, store = store.name(), "Resolved registry credential");
                return Ok(Some(cred));
            }
        }
        Ok(None)
    }
}

impl AuthProvider for CredentialManager {
    fn resolve(&self, registry: &str) -> WrapResult<Option<Credential>> {
        self.get(registry).map_err(|e| match e {
            WrapError::Auth { .. } => e,
            other => WrapError::Auth {
                registry: registry.to_string(),
                message: other.to_string(),
            },
        })
    }
}

/// The ambient keychain: the default credential chain, loaded on first use.
#[derive(Default)]
pub struct Keychain {
    paths: WrapPaths,
    manager: OnceCell<CredentialManager>,
}

impl Keychain {
    /// Keychain reading from the given paths.
    #[must_use]
    pub fn new(paths: WrapPaths) -> Self {
        Self {
            paths,
            manager: OnceCell::new(),
        }
    }
}

impl AuthProvider for Keychain {
    fn resolve(&self, registry: &str) -> WrapResult<Option<Credential>> {
        let manager = self
            .manager
            .get_or_try_init(|| CredentialManager::default_chain(&self.paths))
            .map_err(|e| WrapError::Auth {
                registry: registry.to_string(),
                message: e.to_string(),
            })?;
        manager.resolve(registry)
    }
}
