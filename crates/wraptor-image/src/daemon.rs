//! Loading images into the local container daemon.
//!
//! The image is streamed as a `docker save` style tarball into the stdin of
//! `docker load`, so nothing is staged on disk on this side.

use std::collections::HashSet;
use std::ffi::OsString;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use wraptor_common::{WrapError, WrapResult};
use wraptor_oci::digest::sha256_hex;

use crate::archive;
use crate::image::{BlobForm, BlobInfo, Image, LayerClaim};
use crate::reference::ImageReference;

/// Environment variable naming the daemon CLI.
pub const DOCKER_BIN_ENV: &str = "WRAPTOR_DOCKER_BIN";
const SINK: &str = "daemon";

fn publish_error(message: impl Into<String>) -> WrapError {
    WrapError::publish(SINK, message)
}

/// One entry of a `docker save` manifest.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SaveManifest {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Talks to the daemon through its CLI.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    program: OsString,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Client using `$WRAPTOR_DOCKER_BIN`, or `docker`.
    #[must_use]
    pub fn new() -> Self {
        let program = std::env::var_os(DOCKER_BIN_ENV).unwrap_or_else(|| "docker".into());
        Self { program }
    }

    /// Client running a specific binary.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Load `image` into the daemon, tagged as `tag`.
    pub async fn load(&self, image: &Image, tag: &ImageReference) -> WrapResult<()> {
        let name = tag.daemon_name();
        tracing::info!(tag = %name, program = ?self.program, "Loading image into daemon");

        let mut child = Command::new(&self.program)
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| publish_error(format!("failed to run {:?} load: {e}", self.program)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| publish_error("daemon loader has no stdin"))?;

        let repo_tags = vec![name.clone()];
        let write = async move {
            write_save_archive(image, &repo_tags, &mut stdin).await?;
            stdin
                .shutdown()
                .await
                .map_err(|e| publish_error(format!("failed to close loader input: {e}")))
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        // A broken layer makes the loader fail too; report the layer.
        if let Err(err @ (WrapError::Encoding { .. } | WrapError::Cancelled { .. })) = written {
            return Err(err);
        }
        let output =
            output.map_err(|e| publish_error(format!("failed to wait for loader: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(publish_error(format!(
                "loader exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        written?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::info!(tag = %name, output = %stdout.trim(), "Image loaded");
        Ok(())
    }
}

/// Write `image` as a `docker save` tarball tagged with `repo_tags`.
///
/// Base layers keep their compressed form (`<hex>.tar.gz`) and the loader
/// detects the compression itself. Appended layers that nobody has read yet
/// go in as plain tar (`layer-<n>.tar`), whose length is known before the
/// first byte. The config and `manifest.json` come last, once every diff id
/// is known.
pub async fn write_save_archive<W>(image: &Image, repo_tags: &[String], out: &mut W) -> WrapResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut layers = Vec::with_capacity(image.layer_count());
    let mut written = HashSet::new();
    for layer in image.base_layers() {
        let name = format!("{}.tar.gz", blob_hex(&layer.info.descriptor.digest)?);
        if written.insert(name.clone()) {
            let size = descriptor_size(&layer.info)?;
            let mut reader = layer.open(SINK).await?;
            write_entry(out, &name, size, &mut reader).await?;
        }
        layers.push(name);
    }

    let mut appended = Vec::with_capacity(image.appended_count());
    for index in 0..image.appended_count() {
        let info = match image.claim_layer(index).await? {
            LayerClaim::Fresh(fresh) => {
                let name = format!("layer-{index}.tar");
                let size = fresh.tar_size()?;
                write_header(out, &name, size).await?;
                let info = fresh.stream_into(BlobForm::Uncompressed, out, SINK).await?;
                write_padding(out, &name, size).await?;
                layers.push(name);
                info
            }
            LayerClaim::Streamed(streamed) => {
                let name = format!("{}.tar.gz", blob_hex(&streamed.info.descriptor.digest)?);
                if written.insert(name.clone()) {
                    let size = descriptor_size(&streamed.info)?;
                    let mut reader = streamed.open(SINK).await?;
                    write_entry(out, &name, size, &mut reader).await?;
                }
                layers.push(name);
                streamed.info
            }
        };
        appended.push(info);
    }

    let documents = image.finalize(appended)?;
    let config_name = format!("{}.json", blob_hex(&documents.config_descriptor().digest)?);
    let config = documents.config_bytes();
    write_entry(out, &config_name, config.len() as u64, &mut &config[..]).await?;

    let manifest = vec![SaveManifest {
        config: config_name,
        repo_tags: repo_tags.to_vec(),
        layers,
    }];
    let bytes = serde_json::to_vec(&manifest)?;
    write_entry(out, "manifest.json", bytes.len() as u64, &mut bytes.as_slice()).await?;

    out.write_all(&archive::END_OF_ARCHIVE)
        .await
        .map_err(|e| publish_error(format!("failed to finish archive: {e}")))?;
    out.flush()
        .await
        .map_err(|e| publish_error(format!("failed to finish archive: {e}")))
}

fn blob_hex(digest: &str) -> WrapResult<&str> {
    sha256_hex(digest).ok_or_else(|| publish_error(format!("unsupported digest {digest}")))
}

fn descriptor_size(info: &BlobInfo) -> WrapResult<u64> {
    u64::try_from(info.descriptor.size)
        .map_err(|_| publish_error(format!("negative size for {}", info.descriptor.digest)))
}

async fn write_header<W>(out: &mut W, name: &str, size: u64) -> WrapResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(&archive::file_header(name, size)?)
        .await
        .map_err(|e| publish_error(format!("failed to write {name}: {e}")))
}

async fn write_padding<W>(out: &mut W, name: &str, size: u64) -> WrapResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(archive::padding(size))
        .await
        .map_err(|e| publish_error(format!("failed to write {name}: {e}")))?;
    tracing::debug!(entry = name, size, "Archive entry written");
    Ok(())
}

async fn write_entry<W, R>(out: &mut W, name: &str, size: u64, body: &mut R) -> WrapResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    write_header(out, name, size).await?;
    let copied = tokio::io::copy(body, out)
        .await
        .map_err(|e| publish_error(format!("failed to write {name}: {e}")))?;
    if copied != size {
        return Err(publish_error(format!(
            "{name}: copied {copied} bytes, expected {size}"
        )));
    }
    write_padding(out, name, size).await
}
