//! End-to-end tests for the wrapper: append, materialize, write layouts.

use std::io::Read;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use flate2::read::GzDecoder;
use tokio::io::{AsyncRead, ReadBuf};
use wraptor_common::WrapError;
use wraptor_image::credentials::Anonymous;
use wraptor_image::{NamedStream, Wrapper};
use wraptor_oci::{ImageConfig, ImageIndex, ImageManifest, sha256_digest};

fn wrapper() -> Wrapper {
    Wrapper::builder().auth(Arc::new(Anonymous)).build()
}

fn read_blob(layout: &Path, digest: &str) -> Vec<u8> {
    let hex = digest.strip_prefix("sha256:").unwrap();
    let bytes = std::fs::read(layout.join("blobs/sha256").join(hex)).unwrap();
    assert_eq!(sha256_digest(&bytes), digest);
    bytes
}

/// Entries of every layer of the single image in a layout.
fn layout_layers(layout: &Path) -> (ImageConfig, Vec<Vec<(String, Vec<u8>)>>) {
    let index: ImageIndex =
        serde_json::from_slice(&std::fs::read(layout.join("index.json")).unwrap()).unwrap();
    assert_eq!(index.manifests.len(), 1);
    let manifest: ImageManifest =
        serde_json::from_slice(&read_blob(layout, &index.manifests[0].descriptor.digest)).unwrap();
    let config: ImageConfig =
        serde_json::from_slice(&read_blob(layout, &manifest.config.digest)).unwrap();

    let layers = manifest
        .layers
        .iter()
        .map(|descriptor| {
            let blob = read_blob(layout, &descriptor.digest);
            let mut archive = tar::Archive::new(GzDecoder::new(blob.as_slice()));
            archive
                .entries()
                .unwrap()
                .map(|entry| {
                    let mut entry = entry.unwrap();
                    let path = entry.path().unwrap().to_string_lossy().into_owned();
                    let mut body = Vec::new();
                    entry.read_to_end(&mut body).unwrap();
                    (path, body)
                })
                .collect()
        })
        .collect();
    (config, layers)
}

fn blob_names(layout: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(layout.join("blobs/sha256"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// File body of `remaining` bytes that counts how much of it was read.
struct Counted {
    remaining: u64,
    read: Arc<AtomicU64>,
}

impl AsyncRead for Counted {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let n = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        buf.initialize_unfilled_to(n).fill(7);
        buf.advance(n);
        self.remaining -= n as u64;
        self.read.fetch_add(n as u64, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_all_recorded() {
    let wrapper = Arc::new(wrapper());
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move {
                wrapper.append(vec![NamedStream::from_bytes(format!("file-{i}"), format!("{i}"))])
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(wrapper.layer_count(), 16);
    let image = wrapper.image().await.unwrap();
    assert_eq!(image.appended_count(), 16);

    let dir = tempfile::tempdir().unwrap();
    wrapper.write_archive(dir.path()).await.unwrap();
    let (config, layers) = layout_layers(dir.path());
    assert_eq!(config.rootfs.diff_ids.len(), 16);
    let mut names: Vec<String> = layers.into_iter().map(|l| l[0].0.clone()).collect();
    names.sort();
    let mut expected: Vec<String> = (0..16).map(|i| format!("file-{i}")).collect();
    expected.sort();
    assert_eq!(names, expected);
}

#[test]
fn appends_from_plain_threads() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let wrapper = Arc::new(
        Wrapper::builder()
            .auth(Arc::new(Anonymous))
            .runtime(runtime.handle().clone())
            .build(),
    );

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let wrapper = Arc::clone(&wrapper);
            std::thread::spawn(move || {
                wrapper.append(vec![NamedStream::from_bytes(format!("t{i}.txt"), "x")])
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap().unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    runtime.block_on(wrapper.write_archive(dir.path())).unwrap();
    let (_, layers) = layout_layers(dir.path());
    assert_eq!(layers.len(), 4);

    let detached = Wrapper::builder().auth(Arc::new(Anonymous)).build();
    let err = std::thread::spawn(move || {
        detached.append(vec![NamedStream::from_bytes("a.txt", "abc")])
    })
    .join()
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, WrapError::Config { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn layers_are_read_by_the_first_sink() {
    const SIZE: u64 = 8 * 1024 * 1024;
    let read = Arc::new(AtomicU64::new(0));
    let wrapper = wrapper();
    wrapper
        .append(vec![NamedStream::new(
            "weights.bin",
            SIZE,
            Counted {
                remaining: SIZE,
                read: Arc::clone(&read),
            },
        )])
        .unwrap();

    let image = wrapper.image().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(read.load(Ordering::SeqCst) < 2 * 1024 * 1024);
    assert!(image.digest().is_none());
    assert!(!image.is_spooling());

    let dir = tempfile::tempdir().unwrap();
    wrapper.write_archive(dir.path()).await.unwrap();
    assert_eq!(read.load(Ordering::SeqCst), SIZE);
    assert!(image.digest().is_some());
    // Layer, config and manifest; nothing left half written.
    assert_eq!(blob_names(dir.path()).len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_appends_keep_batches_together() {
    let wrapper = Arc::new(wrapper());
    let left = {
        let wrapper = Arc::clone(&wrapper);
        tokio::spawn(async move {
            wrapper.append(vec![
                NamedStream::from_bytes("left/1", "l1"),
                NamedStream::from_bytes("left/2", "l2"),
            ])
        })
    };
    let right = {
        let wrapper = Arc::clone(&wrapper);
        tokio::spawn(async move {
            wrapper.append(vec![
                NamedStream::from_bytes("right/1", "r1"),
                NamedStream::from_bytes("right/2", "r2"),
            ])
        })
    };
    left.await.unwrap().unwrap();
    right.await.unwrap().unwrap();

    let dir = tempfile::tempdir().unwrap();
    wrapper.write_archive(dir.path()).await.unwrap();
    let (_, layers) = layout_layers(dir.path());
    assert_eq!(layers.len(), 2);
    for layer in layers {
        let names: Vec<&str> = layer.iter().map(|(p, _)| p.as_str()).collect();
        assert!(
            names == ["left/1", "left/2"] || names == ["right/1", "right/2"],
            "{names:?}"
        );
    }
}

#[tokio::test]
async fn concurrent_image_calls_share_one_result() {
    let wrapper = Arc::new(wrapper());
    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move { wrapper.image().await })
        })
        .collect();
    let mut images = Vec::new();
    for call in calls {
        images.push(call.await.unwrap().unwrap());
    }
    assert!(images.iter().all(|i| Arc::ptr_eq(i, &images[0])));
}

#[tokio::test]
async fn failed_materialization_seals_and_is_cached() {
    let wrapper = Arc::new(
        Wrapper::builder()
            .auth(Arc::new(Anonymous))
            .base_image("127.0.0.1:1/nope:latest")
            .build(),
    );
    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move { wrapper.image().await })
        })
        .collect();
    let mut errors = Vec::new();
    for call in calls {
        errors.push(call.await.unwrap().unwrap_err().to_string());
    }
    assert!(errors.iter().all(|e| e == &errors[0]));

    let err = wrapper.image().await.unwrap_err();
    assert!(matches!(err, WrapError::Resolution { .. }), "{err}");

    let err = wrapper
        .append(vec![NamedStream::from_bytes("late.txt", "x")])
        .unwrap_err();
    assert!(matches!(err, WrapError::Sealed));
    assert_eq!(wrapper.layer_count(), 1);
}

#[tokio::test]
async fn encoding_errors_surface_at_the_first_sink() {
    let wrapper = wrapper();
    wrapper
        .append(vec![NamedStream::new(
            "short.bin",
            10,
            std::io::Cursor::new(b"abc".to_vec()),
        )])
        .unwrap();
    wrapper.image().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let err = wrapper.write_archive(&out).await.unwrap_err();
    assert!(matches!(err, WrapError::Encoding { .. }), "{err}");
    assert!(!out.join("index.json").exists());
    assert!(blob_names(&out).is_empty());

    let again = wrapper.write_archive(&out).await.unwrap_err();
    assert_eq!(err.to_string(), again.to_string());
}

#[tokio::test]
async fn archive_without_layers_writes_nothing() {
    let wrapper = wrapper();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("layout");

    wrapper.write_archive(&out).await.unwrap();
    assert!(!out.exists());
    assert!(!wrapper.is_sealed());

    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();
    assert_eq!(wrapper.layer_count(), 1);
}

#[tokio::test]
async fn archive_round_trip_with_prefix() {
    let model = vec![0xAB; 300_000];
    let wrapper = Wrapper::builder()
        .auth(Arc::new(Anonymous))
        .file_prefix("artifacts/")
        .build();
    wrapper
        .append(vec![NamedStream::from_bytes("model.bin", model.clone())])
        .unwrap();
    wrapper
        .append(vec![
            NamedStream::from_bytes("a.txt", "abc"),
            NamedStream::from_bytes("b.txt", ""),
        ])
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    wrapper.write_archive(dir.path()).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("oci-layout")).unwrap(),
        r#"{"imageLayoutVersion":"1.0.0"}"#
    );

    let (config, layers) = layout_layers(dir.path());
    assert_eq!(config.rootfs.diff_ids.len(), 2);
    assert_eq!(config.os, "linux");
    assert_eq!(config.architecture, "amd64");
    assert_eq!(
        layers,
        vec![
            vec![("artifacts/model.bin".to_string(), model)],
            vec![
                ("artifacts/a.txt".to_string(), b"abc".to_vec()),
                ("artifacts/b.txt".to_string(), Vec::new()),
            ],
        ]
    );
}

#[tokio::test]
async fn later_sinks_without_spooling_need_the_blobs_in_place() {
    let wrapper = wrapper();
    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();

    let first = tempfile::tempdir().unwrap();
    wrapper.write_archive(first.path()).await.unwrap();

    let second = tempfile::tempdir().unwrap();
    let err = wrapper.write_archive(second.path()).await.unwrap_err();
    assert!(matches!(err, WrapError::Publish { .. }), "{err}");
    assert!(!second.path().join("index.json").exists());

    // The first layout already holds every layer.
    let index = std::fs::read(first.path().join("index.json")).unwrap();
    wrapper.write_archive(first.path()).await.unwrap();
    assert_eq!(index, std::fs::read(first.path().join("index.json")).unwrap());
}

#[tokio::test]
async fn spooled_layers_publish_to_several_layouts() {
    let wrapper = Wrapper::builder()
        .auth(Arc::new(Anonymous))
        .spool_layers(true)
        .build();
    wrapper
        .append(vec![NamedStream::from_bytes("model.bin", vec![3u8; 50_000])])
        .unwrap();
    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();

    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    wrapper.write_archive(first.path()).await.unwrap();
    wrapper.write_archive(second.path()).await.unwrap();

    assert_eq!(
        std::fs::read(first.path().join("index.json")).unwrap(),
        std::fs::read(second.path().join("index.json")).unwrap()
    );
    assert_eq!(blob_names(first.path()), blob_names(second.path()));
    assert_eq!(layout_layers(first.path()), layout_layers(second.path()));
}

#[tokio::test]
async fn malformed_push_reference_fails_before_sealing() {
    let wrapper = wrapper();
    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();

    for bad in ["", "UPPER/case:v1", "repo:bad tag"] {
        let err = wrapper.publish_to_registry(bad).await.unwrap_err();
        assert!(matches!(err, WrapError::Reference { .. }), "{bad}: {err}");
    }
    assert!(!wrapper.is_sealed());
}

#[tokio::test]
async fn push_to_unreachable_registry_is_a_publish_error() {
    let wrapper = wrapper();
    wrapper
        .append(vec![NamedStream::from_bytes("a.txt", "abc")])
        .unwrap();

    let err = wrapper
        .publish_to_registry("127.0.0.1:1/models/demo:v1")
        .await
        .unwrap_err();
    assert!(matches!(err, WrapError::Publish { .. }), "{err}");
    assert!(wrapper.is_sealed());
}
