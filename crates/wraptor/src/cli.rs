//! Wraptor CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, bail};
use tokio_util::sync::CancellationToken;
use wraptor_common::WrapPaths;
use wraptor_image::{Keychain, Wrapper};
use wraptor_oci::Platform;

use crate::source::huggingface::{DEFAULT_MAX_CONCURRENCY, DEFAULT_REVISION};
use crate::source::{Source, SourceOptions};

/// Wraptor - wrap arbitrary files into container images
#[derive(Parser, Debug)]
#[command(name = "wraptor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Wraptor commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wrap the files from a source into a container image
    Wrap(WrapArgs),
}

/// Where the wrapped image goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Output {
    /// Push to the registry named by --image
    Registry,
    /// Load into the local daemon as the tag --image
    Daemon,
    /// Write an OCI layout to the directory --image
    Archive,
}

/// Options of `wraptor wrap`.
#[derive(Args, Debug)]
pub struct WrapArgs {
    /// Local directory or Hugging Face repository id
    #[arg(long, env = "WRAPTOR_WRAP_SOURCE")]
    pub source: String,

    /// Image reference to create (a directory for --output archive)
    #[arg(long, env = "WRAPTOR_WRAP_IMAGE")]
    pub image: String,

    /// Base image to stack the files on (empty for none)
    #[arg(long = "base", env = "WRAPTOR_WRAP_BASE_IMAGE", default_value = "")]
    pub base_image: String,

    /// Prefix added to every file name in the image
    #[arg(long, env = "WRAPTOR_WRAP_FILE_PREFIX", default_value = "")]
    pub file_prefix: String,

    /// Cache directory for downloaded files
    #[arg(long, env = "WRAPTOR_WRAP_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Revision of a Hugging Face repository
    #[arg(long, env = "WRAPTOR_WRAP_REVISION", default_value = DEFAULT_REVISION)]
    pub revision: String,

    /// Hugging Face access token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Parallel downloads
    #[arg(long, env = "WRAPTOR_WRAP_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Platform to pick when the base image is multi-platform
    #[arg(long, env = "WRAPTOR_WRAP_PLATFORM", default_value = "linux/amd64", value_parser = parse_platform)]
    pub platform: Platform,

    /// Where to publish the image
    #[arg(long, value_enum, env = "WRAPTOR_WRAP_OUTPUT", default_value_t = Output::Registry)]
    pub output: Output,

    /// Remove downloaded files once the image is published
    #[arg(long)]
    pub cleanup: bool,
}

fn parse_platform(value: &str) -> Result<Platform, String> {
    Platform::parse(value).ok_or_else(|| format!("expected os/arch[/variant], got '{value}'"))
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self, cancel: CancellationToken) -> Result<()> {
        match self.command {
            Commands::Wrap(args) => args.run(cancel).await,
        }
    }
}

impl WrapArgs {
    /// Load the source, wrap one layer per file and publish.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if self.source.trim().is_empty() {
            bail!("--source is required");
        }
        if self.image.trim().is_empty() {
            bail!("--image is required");
        }

        let paths = match &self.cache_dir {
            Some(dir) => WrapPaths::with_cache(dir),
            None => WrapPaths::new(),
        };
        let source = Source::detect(
            &self.source,
            &SourceOptions {
                cache_dir: paths.cache.clone(),
                revision: self.revision.clone(),
                token: self.hf_token.clone(),
                max_concurrency: self.max_concurrency,
            },
        )?;

        tracing::info!(source = %self.source, image = %self.image, output = ?self.output, "Wrapping files");
        let streams = source.load(&cancel).await?;

        let wrapper = Wrapper::builder()
            .base_image(&self.base_image)
            .file_prefix(&self.file_prefix)
            .platform(self.platform.clone())
            .auth(Arc::new(Keychain::new(paths)))
            .cancellation(cancel)
            .build();

        let files = streams.len();
        for stream in streams {
            wrapper.append(vec![stream])?;
        }

        match self.output {
            Output::Registry => {
                let digest = wrapper.publish_to_registry(&self.image).await?;
                println!("Pushed {} ({files} files)", self.image);
                println!("Digest: {digest}");
            }
            Output::Daemon => {
                wrapper.publish_to_daemon(&self.image).await?;
                println!("Loaded {} ({files} files)", self.image);
            }
            Output::Archive => {
                wrapper.write_archive(&self.image).await?;
                println!("Wrote OCI layout to {} ({files} files)", self.image);
            }
        }

        if self.cleanup {
            if let Source::HuggingFace(hf) = &source {
                hf.cleanup().await?;
                tracing::info!(repo = %hf.repo_id(), "Removed download cache");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_defaults() {
        let cli = Cli::try_parse_from([
            "wraptor",
            "wrap",
            "--source",
            "org/model",
            "--image",
            "ghcr.io/org/model:v1",
        ])
        .unwrap();
        let Commands::Wrap(args) = cli.command;
        assert_eq!(args.output, Output::Registry);
        assert_eq!(args.platform, Platform::linux_amd64());
        assert_eq!(args.revision, "main");
        assert_eq!(args.max_concurrency, 5);
        assert!(args.base_image.is_empty());
    }

    #[test]
    fn wrap_options() {
        let cli = Cli::try_parse_from([
            "wraptor",
            "--debug",
            "wrap",
            "--source",
            "./models",
            "--image",
            "out",
            "--base",
            "alpine:3.19",
            "--file-prefix",
            "models/",
            "--platform",
            "linux/arm64/v8",
            "--output",
            "archive",
        ])
        .unwrap();
        assert!(cli.debug);
        let Commands::Wrap(args) = cli.command;
        assert_eq!(args.output, Output::Archive);
        assert_eq!(args.platform, Platform::linux_arm64());
        assert_eq!(args.file_prefix, "models/");
        assert_eq!(args.base_image, "alpine:3.19");
    }

    #[test]
    fn rejects_bad_platform() {
        assert!(
            Cli::try_parse_from([
                "wraptor", "wrap", "--source", "x", "--image", "y", "--platform", "linux",
            ])
            .is_err()
        );
    }

    #[tokio::test]
    async fn wraps_local_directory_into_archive() {
        let input = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("model.bin"), vec![5u8; 2048]).unwrap();
        std::fs::write(input.path().join("config.json"), "{}").unwrap();
        let output = tempfile::tempdir().unwrap();
        let layout = output.path().join("layout");

        let cli = Cli::try_parse_from([
            "wraptor",
            "wrap",
            "--source",
            input.path().to_str().unwrap(),
            "--image",
            layout.to_str().unwrap(),
            "--output",
            "archive",
            "--file-prefix",
            "artifacts/",
        ])
        .unwrap();
        cli.execute(CancellationToken::new()).await.unwrap();

        let index: wraptor_oci::ImageIndex =
            serde_json::from_slice(&std::fs::read(layout.join("index.json")).unwrap()).unwrap();
        assert_eq!(index.manifests.len(), 1);
        let hex = index.manifests[0]
            .descriptor
            .digest
            .trim_start_matches("sha256:");
        let manifest: wraptor_oci::ImageManifest =
            serde_json::from_slice(&std::fs::read(layout.join("blobs/sha256").join(hex)).unwrap())
                .unwrap();
        assert_eq!(manifest.layers.len(), 2, "one layer per file");
    }
}
