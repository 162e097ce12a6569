//! Streaming layers built from batches of named streams.
//!
//! A [`Layer`] is the read side of a bounded channel. A background producer
//! task writes the tar encoding of its batch into the channel while the
//! first sink to publish the layer hashes and compresses whatever has
//! arrived, so a batch is never held in memory as a whole.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use wraptor_common::{WrapError, WrapResult};

use crate::archive;
use crate::stream::NamedStream;

/// Chunks buffered between producer and consumer.
const CHANNEL_CAPACITY: usize = 16;
/// Upper bound for a single body chunk.
const CHUNK_SIZE: usize = 64 * 1024;

type Chunk = io::Result<Bytes>;

/// One file recorded in a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Archive path (prefix + stream name).
    pub path: String,
    /// Declared size in bytes.
    pub size: u64,
}

/// A layer whose tar bytes are produced on demand.
///
/// It can be consumed exactly once. Dropping it unconsumed stops the
/// producer.
pub struct Layer {
    entries: Vec<LayerEntry>,
    reader: StreamReader<ReceiverStream<Chunk>, Bytes>,
    producer: JoinHandle<()>,
}

impl Layer {
    /// Files in this layer, in archive order.
    #[must_use]
    pub fn entries(&self) -> &[LayerEntry] {
        &self.entries
    }

    /// Sum of the declared entry sizes.
    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Exact length of the tar encoding, headers and end marker included.
    pub fn tar_size(&self) -> WrapResult<u64> {
        let mut total = archive::END_OF_ARCHIVE.len() as u64;
        for entry in &self.entries {
            let header = archive::file_header(&entry.path, entry.size)?;
            total += header.len() as u64 + entry.size + archive::padding(entry.size).len() as u64;
        }
        Ok(total)
    }

    /// Split into the tar byte stream and the producer handle.
    ///
    /// The stream's errors carry a [`WrapError`]; see [`stream_error`].
    pub(crate) fn into_parts(self) -> (impl AsyncRead + Send + Unpin, JoinHandle<()>) {
        (self.reader, self.producer)
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

/// Recover the [`WrapError`] a producer put into the channel.
pub(crate) fn stream_error(err: &io::Error) -> WrapError {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<WrapError>())
        .cloned()
        .unwrap_or_else(|| WrapError::encoding(err.to_string()))
}

/// Turns batches of [`NamedStream`]s into [`Layer`]s.
#[derive(Debug, Clone, Default)]
pub struct LayerBuilder {
    prefix: String,
    cancel: CancellationToken,
    runtime: Option<Handle>,
}

impl LayerBuilder {
    /// Create a builder that prefixes every entry name with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cancel: CancellationToken::new(),
            runtime: None,
        }
    }

    /// Abort producers when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run producers on `runtime` instead of the caller's runtime.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Archive path for a stream name.
    ///
    /// Archive paths are relative, so a leading `/` is dropped.
    #[must_use]
    pub fn entry_path(&self, name: &str) -> String {
        let joined = format!("{}{}", self.prefix, name);
        joined.trim_start_matches('/').to_string()
    }

    /// Start encoding `batch` into a new layer.
    ///
    /// The producer runs as a task on the configured runtime (or the
    /// caller's, when there is none) and starts immediately, blocking on the
    /// channel until the layer is consumed. Fails when neither runtime
    /// exists.
    pub fn build(&self, batch: Vec<NamedStream>) -> WrapResult<Layer> {
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|e| WrapError::Config {
                message: format!("no Tokio runtime for the layer producer: {e}"),
            })?,
        };
        let entries: Vec<LayerEntry> = batch
            .iter()
            .map(|s| LayerEntry {
                path: self.entry_path(s.name()),
                size: s.size(),
            })
            .collect();

        tracing::debug!(
            entries = entries.len(),
            bytes = entries.iter().map(|e| e.size).sum::<u64>(),
            "Starting layer producer"
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let streams = entries.iter().map(|e| e.path.clone()).zip(batch).collect();
        let producer = runtime.spawn(produce(streams, tx, self.cancel.clone()));

        Ok(Layer {
            entries,
            reader: StreamReader::new(ReceiverStream::new(rx)),
            producer,
        })
    }
}

/// Producer task: write the batch, or the reason it failed, into the channel.
async fn produce(
    streams: Vec<(String, NamedStream)>,
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        result = write_batch(streams, &tx) => result,
        () = cancel.cancelled() => Err(WrapError::cancelled("layer encoding")),
    };

    if let Err(err) = result {
        if matches!(err, WrapError::Internal { .. }) {
            // Consumer is gone; nobody is left to tell.
            return;
        }
        tracing::warn!(error = %err, "Layer producer aborted");
        let _ = tx.send(Err(io::Error::other(err))).await;
    }
}

async fn write_batch(streams: Vec<(String, NamedStream)>, tx: &mpsc::Sender<Chunk>) -> WrapResult<()> {
    for (path, stream) in streams {
        let size = stream.size();
        send(tx, Bytes::from(archive::file_header(&path, size)?)).await?;
        copy_body(&path, size, stream, tx).await?;
        send(tx, Bytes::from_static(archive::padding(size))).await?;
        tracing::trace!(path = %path, size, "Layer entry written");
    }
    send(tx, Bytes::from_static(&archive::END_OF_ARCHIVE)).await
}

async fn copy_body(path: &str, size: u64, stream: NamedStream, tx: &mpsc::Sender<Chunk>) -> WrapResult<()> {
    let mut reader = stream.into_reader();
    let mut copied = 0u64;

    {
        let mut limited = (&mut reader).take(size);
        loop {
            let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
            let n = limited
                .read_buf(&mut chunk)
                .await
                .map_err(|e| WrapError::encoding(format!("failed to read {path}: {e}")))?;
            if n == 0 {
                break;
            }
            copied += n as u64;
            send(tx, chunk.freeze()).await?;
        }
    }

    if copied < size {
        return Err(WrapError::encoding(format!(
            "{path}: stream ended after {copied} of {size} declared bytes"
        )));
    }

    let mut probe = [0u8; 1];
    let extra = reader
        .read(&mut probe)
        .await
        .map_err(|e| WrapError::encoding(format!("failed to read {path}: {e}")))?;
    if extra > 0 {
        return Err(WrapError::encoding(format!(
            "{path}: stream is longer than its declared {size} bytes"
        )));
    }

    Ok(())
}

async fn send(tx: &mpsc::Sender<Chunk>, bytes: Bytes) -> WrapResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    tx.send(Ok(bytes)).await.map_err(|_| WrapError::Internal {
        message: "layer consumer dropped".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    async fn drain(layer: Layer) -> WrapResult<Vec<u8>> {
        let (mut reader, producer) = layer.into_parts();
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .await
            .map_err(|e| stream_error(&e))?;
        producer.await.unwrap();
        Ok(out)
    }

    fn entries_of(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut ar = tar::Archive::new(bytes);
        ar.entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let path = e.path().unwrap().to_string_lossy().into_owned();
                let mut body = Vec::new();
                e.read_to_end(&mut body).unwrap();
                (path, body)
            })
            .collect()
    }

    #[tokio::test]
    async fn encodes_entries_in_order_with_prefix() {
        let builder = LayerBuilder::new("artifacts/");
        let layer = builder
            .build(vec![
                NamedStream::from_bytes("a.txt", "abc"),
                NamedStream::from_bytes("b.txt", ""),
            ])
            .unwrap();
        assert_eq!(layer.entries().len(), 2);
        assert_eq!(layer.entries()[0].path, "artifacts/a.txt");
        assert_eq!(layer.content_size(), 3);
        let tar_size = layer.tar_size().unwrap();

        let bytes = drain(layer).await.unwrap();
        assert_eq!(bytes.len() as u64, tar_size);
        assert_eq!(
            entries_of(&bytes),
            vec![
                ("artifacts/a.txt".to_string(), b"abc".to_vec()),
                ("artifacts/b.txt".to_string(), Vec::new()),
            ]
        );
    }

    #[tokio::test]
    async fn large_body_streams_through_small_channel() {
        let data = vec![42u8; CHUNK_SIZE * CHANNEL_CAPACITY * 3 + 17];
        let layer = LayerBuilder::default()
            .build(vec![NamedStream::from_bytes("big.bin", data.clone())])
            .unwrap();

        let bytes = drain(layer).await.unwrap();
        let entries = entries_of(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, data);
    }

    #[tokio::test]
    async fn short_stream_fails_the_layer() {
        let stream = NamedStream::new("short.bin", 10, std::io::Cursor::new(b"abc".to_vec()));
        let layer = LayerBuilder::default().build(vec![stream]).unwrap();

        let err = drain(layer).await.unwrap_err();
        assert!(matches!(err, WrapError::Encoding { .. }), "{err}");
        assert!(err.to_string().contains("3 of 10"));
    }

    #[tokio::test]
    async fn long_stream_fails_the_layer() {
        let stream = NamedStream::new("long.bin", 2, std::io::Cursor::new(b"abc".to_vec()));
        let layer = LayerBuilder::default().build(vec![stream]).unwrap();

        let err = drain(layer).await.unwrap_err();
        assert!(err.to_string().contains("longer than"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_layer_error() {
        let cancel = CancellationToken::new();
        let (_writer, pending) = tokio::io::duplex(64);
        let builder = LayerBuilder::new("").with_cancellation(cancel.clone());
        let layer = builder
            .build(vec![NamedStream::new("never.bin", 100, pending)])
            .unwrap();

        cancel.cancel();
        let err = drain(layer).await.unwrap_err();
        assert!(matches!(err, WrapError::Cancelled { .. }), "{err}");
    }

    #[test]
    fn builds_from_a_plain_thread_with_a_runtime_handle() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let builder = LayerBuilder::new("").with_runtime(runtime.handle().clone());

        let layer = std::thread::spawn(move || {
            builder.build(vec![NamedStream::from_bytes("a.txt", "abc")])
        })
        .join()
        .unwrap()
        .unwrap();
        let bytes = runtime.block_on(drain(layer)).unwrap();
        assert_eq!(entries_of(&bytes)[0].1, b"abc");

        let err = LayerBuilder::default()
            .build(vec![NamedStream::from_bytes("a.txt", "abc")])
            .unwrap_err();
        assert!(matches!(err, WrapError::Config { .. }), "{err}");
    }

    #[test]
    fn entry_paths_are_relative() {
        let builder = LayerBuilder::new("/models/");
        assert_eq!(builder.entry_path("config.json"), "models/config.json");
    }
}
