//! Registry client (OCI distribution API).
//!
//! Handles the token dance (`Www-Authenticate: Bearer ...` and `Basic`),
//! manifest and blob reads for base images, and the blob/manifest uploads
//! used when pushing.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url, header};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use wraptor_common::{WrapError, WrapResult};
use wraptor_oci::media_types;

use crate::credentials::{AuthProvider, Credential};
use crate::image::{BaseLayer, BlobForm, BlobInfo, FreshLayer, Image, LayerClaim};
use crate::reference::{ImageReference, ImageTag};

/// Uploads running at once while pushing layers.
const MAX_CONCURRENT_UPLOADS: usize = 4;
/// Buffer between a layer being compressed and its upload body.
const UPLOAD_PIPE_SIZE: usize = 64 * 1024;
const SINK: &str = "registry";

/// Manifest types accepted when resolving a reference.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

static CHALLENGE_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge pattern is valid"));

/// Errors talking to a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Credentials were missing, rejected, or could not be looked up.
    #[error("authentication failed for {registry}: {message}")]
    Auth {
        /// Registry host.
        registry: String,
        /// The error message.
        message: String,
    },

    /// The request never got a response.
    #[error("request to {url} failed: {message}")]
    Network {
        /// Request URL.
        url: String,
        /// The error message.
        message: String,
    },

    /// The registry answered with an error status.
    #[error("{url} returned {status}: {message}")]
    Status {
        /// Request URL.
        url: String,
        /// Response status.
        status: StatusCode,
        /// Response body, trimmed.
        message: String,
    },

    /// The registry answered with something unexpected.
    #[error("invalid registry response: {message}")]
    Protocol {
        /// The error message.
        message: String,
    },
}

/// Result type for registry calls.
pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    /// Convert to a [`WrapError`], keeping authentication failures distinct.
    pub fn into_wrap(self, other: impl FnOnce(String) -> WrapError) -> WrapError {
        match self {
            Self::Auth { registry, message } => WrapError::Auth { registry, message },
            e => other(e.to_string()),
        }
    }

    fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Authorization {
    Bearer(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// A parsed `Www-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// `bearer` or `basic`, lowercased.
    pub scheme: String,
    /// Parameters such as `realm`, `service` and `scope`.
    pub params: HashMap<String, String>,
}

impl Challenge {
    /// Parse `Bearer realm="...",service="...",scope="..."`.
    ///
    /// Quoted values may contain commas (`scope="repository:a:pull,push"`).
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.is_empty() {
            return None;
        }
        let params = CHALLENGE_PARAM_RE
            .captures_iter(rest)
            .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
            .collect();
        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            params,
        })
    }
}

/// Where a blob upload stands after asking for a cross-repository mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStart {
    /// The registry linked the blob; nothing to upload.
    Mounted,
    /// Upload the blob to this session URL.
    Session(Url),
}

/// Registry client for one registry host.
pub struct RegistryClient {
    client: Client,
    registry: String,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
    /// Authorization per scope set.
    authorizations: Mutex<HashMap<String, Authorization>>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("registry", &self.registry)
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Scope needed to read a repository.
#[must_use]
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{repository}:pull")
}

/// Scope needed to write a repository.
#[must_use]
pub fn push_scope(repository: &str) -> String {
    format!("repository:{repository}:pull,push")
}

impl RegistryClient {
    /// Create a client for the registry `reference` points at.
    pub fn new(reference: &ImageReference, auth: Arc<dyn AuthProvider>) -> WrapResult<Self> {
        let base_url = Url::parse(&reference.api_base_url())
            .map_err(|e| WrapError::reference(reference.to_string(), e.to_string()))?;
        let client = Client::builder()
            .user_agent(concat!("wraptor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WrapError::Internal {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            registry: reference.registry.clone(),
            base_url,
            auth,
            authorizations: Mutex::new(HashMap::new()),
        })
    }

    /// Registry host this client talks to.
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    fn url(&self, path: &str) -> RegistryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RegistryError::protocol(format!("invalid URL path {path}: {e}")))
    }

    fn network(url: &Url, err: &reqwest::Error) -> RegistryError {
        RegistryError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    fn authorize_request(&self, key: &str, request: RequestBuilder) -> RequestBuilder {
        let authorization = self.authorizations.lock().get(key).cloned();
        match authorization {
            Some(Authorization::Bearer(token)) => request.bearer_auth(token),
            Some(Authorization::Basic { username, password }) => {
                request.basic_auth(username, password)
            }
            None => request,
        }
    }

    /// Send once with whatever authorization is cached for `scopes`.
    async fn send_once(
        &self,
        scopes: &[String],
        url: &Url,
        request: RequestBuilder,
    ) -> RegistryResult<Response> {
        self.authorize_request(&scopes.join(" "), request)
            .send()
            .await
            .map_err(|e| Self::network(url, &e))
    }

    /// Send, answering one authentication challenge if the registry asks.
    ///
    /// `build` is called again for the retry, so it must not carry a
    /// streaming body.
    async fn send(
        &self,
        scopes: &[String],
        url: &Url,
        build: impl Fn() -> RequestBuilder,
    ) -> RegistryResult<Response> {
        let response = self.send_once(scopes, url, build()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| self.auth_error("registry returned 401 without a usable challenge"))?;

        tracing::debug!(registry = %self.registry, scheme = %challenge.scheme, "Authenticating");
        let authorization = self.authenticate(&challenge, scopes).await?;
        {
            // A token for several scopes also serves each of them alone.
            let mut cached = self.authorizations.lock();
            if scopes.len() > 1 {
                for scope in scopes {
                    cached.insert(scope.clone(), authorization.clone());
                }
            }
            cached.insert(scopes.join(" "), authorization);
        }

        let response = self.send_once(scopes, url, build()).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.auth_error(format!("credentials rejected for {url}")));
        }
        Ok(response)
    }

    fn auth_error(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::Auth {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    /// Providers may read files or run credential helpers, so they are
    /// called on the blocking pool.
    async fn credential(&self) -> RegistryResult<Option<Credential>> {
        let auth = Arc::clone(&self.auth);
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || auth.resolve(&registry))
            .await
            .map_err(|e| self.auth_error(format!("credential lookup failed: {e}")))?
            .map_err(|e| self.auth_error(e.to_string()))
    }

    async fn authenticate(
        &self,
        challenge: &Challenge,
        scopes: &[String],
    ) -> RegistryResult<Authorization> {
        let credential = self.credential().await?;

        match challenge.scheme.as_str() {
            "basic" => {
                let credential = credential
                    .ok_or_else(|| self.auth_error("registry requires credentials"))?;
                Ok(Authorization::Basic {
                    username: credential.username.clone(),
                    password: credential.secret().map(String::from),
                })
            }
            "bearer" => self.fetch_token(challenge, scopes, credential.as_ref()).await,
            other => Err(self.auth_error(format!("unsupported auth scheme '{other}'"))),
        }
    }

    async fn fetch_token(
        &self,
        challenge: &Challenge,
        scopes: &[String],
        credential: Option<&Credential>,
    ) -> RegistryResult<Authorization> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| self.auth_error("missing realm in Www-Authenticate"))?;
        let mut url = Url::parse(realm)
            .map_err(|e| self.auth_error(format!("invalid token realm {realm}: {e}")))?;
        let service = challenge.params.get("service").cloned().unwrap_or_default();

        // Fall back to the scope the registry asked for.
        let scopes: Vec<String> = if scopes.is_empty() {
            challenge.params.get("scope").cloned().into_iter().collect()
        } else {
            scopes.to_vec()
        };

        let request = match credential {
            Some(cred) if cred.password.is_none() && cred.identity_token.is_some() => {
                let token = cred.identity_token.clone().unwrap_or_default();
                self.client.post(url.clone()).form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", token.as_str()),
                    ("service", service.as_str()),
                    ("client_id", "wraptor"),
                    ("scope", scopes.join(" ").as_str()),
                ])
            }
            _ => {
                {
                    let mut query = url.query_pairs_mut();
                    if !service.is_empty() {
                        query.append_pair("service", &service);
                    }
                    for scope in &scopes {
                        query.append_pair("scope", scope);
                    }
                }
                let request = self.client.get(url.clone());
                match credential {
                    Some(cred) => request.basic_auth(&cred.username, cred.secret()),
                    None => request,
                }
            }
        };

        tracing::debug!(realm = %realm, scopes = ?scopes, "Requesting token");
        let response = request.send().await.map_err(|e| Self::network(&url, &e))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.auth_error(format!("token endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(self.auth_error(format!("token request failed with {status}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_error(format!("failed to parse token response: {e}")))?;

        token
            .token
            .or(token.access_token)
            .map(Authorization::Bearer)
            .ok_or_else(|| self.auth_error("no token in response"))
    }

    async fn check(url: &Url, response: Response) -> RegistryResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message: String = body.trim().chars().take(512).collect();
        Err(RegistryError::Status {
            url: url.to_string(),
            status,
            message,
        })
    }

    /// Fetch a manifest or index, returning its bytes and media type.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> RegistryResult<(Vec<u8>, String)> {
        let url = self.url(&format!("/v2/{repository}/manifests/{reference}"))?;
        tracing::debug!(url = %url, "Getting manifest");

        let scopes = [pull_scope(repository)];
        let response = self
            .send(&scopes, &url, || {
                self.client
                    .get(url.clone())
                    .header(header::ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;
        let response = Self::check(&url, response).await?;

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::network(&url, &e))?;

        Ok((bytes.to_vec(), media_type))
    }

    /// Pull a (small) blob into memory.
    pub async fn get_blob(&self, repository: &str, digest: &str) -> RegistryResult<Vec<u8>> {
        let url = self.url(&format!("/v2/{repository}/blobs/{digest}"))?;
        tracing::debug!(url = %url, "Getting blob");

        let scopes = [pull_scope(repository)];
        let response = self
            .send(&scopes, &url, || self.client.get(url.clone()))
            .await?;
        let bytes = Self::check(&url, response)
            .await?
            .bytes()
            .await
            .map_err(|e| Self::network(&url, &e))?;

        Ok(bytes.to_vec())
    }

    /// Stream a blob without buffering it.
    pub async fn blob_stream(
        &self,
        repository: &str,
        digest: &str,
    ) -> RegistryResult<BoxStream<'static, io::Result<Bytes>>> {
        let url = self.url(&format!("/v2/{repository}/blobs/{digest}"))?;
        tracing::debug!(url = %url, "Streaming blob");

        let scopes = [pull_scope(repository)];
        let response = self
            .send(&scopes, &url, || self.client.get(url.clone()))
            .await?;
        let response = Self::check(&url, response).await?;

        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }

    /// Whether `repository` already holds `digest`.
    pub async fn blob_exists(&self, repository: &str, digest: &str) -> RegistryResult<bool> {
        let url = self.url(&format!("/v2/{repository}/blobs/{digest}"))?;
        let scopes = [push_scope(repository)];
        let response = self
            .send(&scopes, &url, || self.client.head(url.clone()))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Self::check(&url, response).await.map(|_| false),
        }
    }

    fn session_url(&self, response: &Response) -> RegistryResult<Url> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::protocol("upload response without Location"))?;
        self.base_url
            .join(location)
            .map_err(|e| RegistryError::protocol(format!("invalid Location {location}: {e}")))
    }

    /// Ask the registry to link `digest` from another repository.
    pub async fn mount_blob(
        &self,
        repository: &str,
        digest: &str,
        from: &str,
    ) -> RegistryResult<UploadStart> {
        let mut url = self.url(&format!("/v2/{repository}/blobs/uploads/"))?;
        url.query_pairs_mut()
            .append_pair("mount", digest)
            .append_pair("from", from);

        let scopes = [push_scope(repository), pull_scope(from)];
        let response = self
            .send(&scopes, &url, || self.client.post(url.clone()))
            .await?;
        let response = Self::check(&url, response).await?;

        if response.status() == StatusCode::CREATED {
            tracing::debug!(digest, from, "Blob mounted");
            return Ok(UploadStart::Mounted);
        }
        Ok(UploadStart::Session(self.session_url(&response)?))
    }

    /// Open an upload session.
    pub async fn start_upload(&self, repository: &str) -> RegistryResult<Url> {
        let url = self.url(&format!("/v2/{repository}/blobs/uploads/"))?;
        let scopes = [push_scope(repository)];
        let response = self
            .send(&scopes, &url, || self.client.post(url.clone()))
            .await?;
        let response = Self::check(&url, response).await?;
        self.session_url(&response)
    }

    /// Stream `body` into an upload session.
    ///
    /// The body cannot be replayed, so the session's authorization must
    /// already be cached by [`Self::start_upload`] or [`Self::mount_blob`].
    /// Returns the location to commit to.
    pub async fn patch_upload(
        &self,
        repository: &str,
        session: Url,
        body: Body,
    ) -> RegistryResult<Url> {
        let scopes = [push_scope(repository)];
        let request = self
            .client
            .patch(session.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        let response = self.send_once(&scopes, &session, request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.auth_error(format!("upload to {session} was not authorized")));
        }
        let response = Self::check(&session, response).await?;
        self.session_url(&response)
    }

    /// Finish an upload as `digest`.
    ///
    /// Authenticates again if the registry asks, since a large upload can
    /// outlive its token.
    pub async fn commit_upload(
        &self,
        repository: &str,
        location: Url,
        digest: &str,
    ) -> RegistryResult<()> {
        let mut commit = location;
        commit.query_pairs_mut().append_pair("digest", digest);

        let scopes = [push_scope(repository)];
        let response = self
            .send(&scopes, &commit, || {
                self.client
                    .put(commit.clone())
                    .header(header::CONTENT_LENGTH, 0)
            })
            .await?;
        Self::check(&commit, response).await?;

        tracing::debug!(repository, digest, "Blob uploaded");
        Ok(())
    }

    /// Stream `body`, whose digest is known, into a session and commit it.
    pub async fn upload_blob(
        &self,
        repository: &str,
        session: Url,
        digest: &str,
        body: Body,
    ) -> RegistryResult<()> {
        let location = self.patch_upload(repository, session, body).await?;
        self.commit_upload(repository, location, digest).await
    }

    /// Upload a manifest under a tag or digest.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        manifest: Bytes,
    ) -> RegistryResult<()> {
        let url = self.url(&format!("/v2/{repository}/manifests/{reference}"))?;
        let scopes = [push_scope(repository)];
        let response = self
            .send(&scopes, &url, || {
                self.client
                    .put(url.clone())
                    .header(header::CONTENT_TYPE, media_type)
                    .body(manifest.clone())
            })
            .await?;
        Self::check(&url, response).await?;
        Ok(())
    }

    /// Push every blob of `image`, then its config and manifest, to `target`.
    ///
    /// Appended layers that nobody has read yet are compressed straight into
    /// their upload; the config and manifest go last since they name the
    /// layer digests. Returns the manifest digest.
    pub async fn push_image(&self, image: &Image, target: &ImageReference) -> WrapResult<String> {
        let repository = target.repository.as_str();
        let publish_err = |e: RegistryError| e.into_wrap(|m| WrapError::publish(SINK, m));

        tracing::info!(
            target = %target,
            layers = image.layer_count(),
            "Pushing image to registry"
        );

        futures::stream::iter(image.base_layers())
            .map(|layer| self.push_base_layer(layer, repository))
            .buffer_unordered(MAX_CONCURRENT_UPLOADS)
            .try_collect::<Vec<()>>()
            .await?;

        let appended = futures::stream::iter(0..image.appended_count())
            .map(|index| self.push_appended_layer(image, index, repository))
            .buffered(MAX_CONCURRENT_UPLOADS)
            .try_collect::<Vec<BlobInfo>>()
            .await?;

        let documents = image.finalize(appended)?;
        if let ImageTag::Digest(digest) = &target.reference {
            if digest != documents.digest() {
                return Err(WrapError::publish(
                    SINK,
                    format!("image digest {} does not match {digest}", documents.digest()),
                ));
            }
        }

        let config = documents.config_descriptor();
        if !self
            .blob_exists(repository, &config.digest)
            .await
            .map_err(publish_err)?
        {
            let session = self.start_upload(repository).await.map_err(publish_err)?;
            self.upload_blob(
                repository,
                session,
                &config.digest,
                Body::from(documents.config_bytes().to_vec()),
            )
            .await
            .map_err(publish_err)?;
        }

        self.put_manifest(
            repository,
            target.reference.as_str(),
            documents.manifest_media_type(),
            Bytes::copy_from_slice(documents.manifest_bytes()),
        )
        .await
        .map_err(publish_err)?;

        tracing::info!(target = %target, digest = %documents.digest(), "Image pushed");
        Ok(documents.digest().to_string())
    }

    async fn push_base_layer(&self, layer: &BaseLayer, repository: &str) -> WrapResult<()> {
        let digest = layer.info.descriptor.digest.as_str();
        let publish_err = |e: RegistryError| e.into_wrap(|m| WrapError::publish(SINK, m));

        if self
            .blob_exists(repository, digest)
            .await
            .map_err(publish_err)?
        {
            tracing::debug!(digest, "Base layer already present");
            return Ok(());
        }

        let session = if layer.registry() == self.registry {
            match self
                .mount_blob(repository, digest, layer.repository())
                .await
                .map_err(publish_err)?
            {
                UploadStart::Mounted => return Ok(()),
                UploadStart::Session(url) => url,
            }
        } else {
            self.start_upload(repository).await.map_err(publish_err)?
        };

        let body = Body::wrap_stream(ReaderStream::new(layer.open(SINK).await?));
        self.upload_blob(repository, session, digest, body)
            .await
            .map_err(publish_err)?;

        tracing::debug!(digest, size = layer.info.descriptor.size, "Base layer pushed");
        Ok(())
    }

    async fn push_appended_layer(
        &self,
        image: &Image,
        index: usize,
        repository: &str,
    ) -> WrapResult<BlobInfo> {
        let publish_err = |e: RegistryError| e.into_wrap(|m| WrapError::publish(SINK, m));

        match image.claim_layer(index).await? {
            LayerClaim::Fresh(fresh) => self.upload_fresh(fresh, repository).await,
            LayerClaim::Streamed(streamed) => {
                let digest = streamed.info.descriptor.digest.as_str();
                if !self
                    .blob_exists(repository, digest)
                    .await
                    .map_err(publish_err)?
                {
                    let session = self.start_upload(repository).await.map_err(publish_err)?;
                    let body = Body::wrap_stream(ReaderStream::new(streamed.open(SINK).await?));
                    self.upload_blob(repository, session, digest, body)
                        .await
                        .map_err(publish_err)?;
                }
                Ok(streamed.info)
            }
        }
    }

    /// Compress a layer into an upload session and commit it under the
    /// digest computed on the way.
    async fn upload_fresh(&self, fresh: FreshLayer<'_>, repository: &str) -> WrapResult<BlobInfo> {
        let publish_err = |e: RegistryError| e.into_wrap(|m| WrapError::publish(SINK, m));
        let session = self.start_upload(repository).await.map_err(publish_err)?;

        let (mut writer, reader) = tokio::io::duplex(UPLOAD_PIPE_SIZE);
        let stream = async move {
            let info = fresh
                .stream_into(BlobForm::Compressed, &mut writer, SINK)
                .await?;
            writer
                .shutdown()
                .await
                .map_err(|e| WrapError::publish(SINK, format!("failed to finish layer: {e}")))?;
            Ok::<_, WrapError>(info)
        };
        let body = Body::wrap_stream(ReaderStream::new(reader));
        let (streamed, patched) = tokio::join!(stream, self.patch_upload(repository, session, body));

        // An upload cut short by a broken layer is never committed.
        let (info, location) = match (streamed, patched) {
            (Ok(info), Ok(location)) => (info, location),
            (Err(err @ (WrapError::Encoding { .. } | WrapError::Cancelled { .. })), _) => {
                return Err(err);
            }
            (_, Err(err)) => return Err(publish_err(err)),
            (Err(err), Ok(_)) => return Err(err),
        };
        self.commit_upload(repository, location, &info.descriptor.digest)
            .await
            .map_err(publish_err)?;

        tracing::debug!(digest = %info.descriptor.digest, size = info.descriptor.size, "Layer pushed");
        Ok(info)
    }
}

/// Whether a manifest media type is one this crate can compose on.
#[must_use]
pub fn is_image_manifest(media_type: &str) -> bool {
    media_type.is_empty()
        || media_type == media_types::MANIFEST
        || media_type == media_types::DOCKER_MANIFEST
}
