//! Named, sized byte streams fed into layers.

use std::fmt;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;
use wraptor_common::WrapResult;

/// Boxed async reader used for stream bodies.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// A readable resource with a logical name and a declared size.
///
/// The source must yield exactly `size` bytes before EOF; the layer builder
/// rejects streams that end early or run long. The reader is released when
/// the stream is dropped, which happens once the builder has read it to the
/// end.
pub struct NamedStream {
    name: String,
    size: u64,
    reader: BoxReader,
}

impl NamedStream {
    /// Wrap any async reader.
    pub fn new(name: impl Into<String>, size: u64, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            name: name.into(),
            size,
            reader: Box::pin(reader),
        }
    }

    /// In-memory stream, mostly useful for small generated files and tests.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(name, size, std::io::Cursor::new(data))
    }

    /// Open a file on disk, declaring its current length as the size.
    pub async fn open(path: impl AsRef<Path>, name: impl Into<String>) -> WrapResult<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        Ok(Self::new(name, size, file))
    }

    /// Logical name of the stream.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn into_reader(self) -> BoxReader {
        self.reader
    }
}

impl fmt::Debug for NamedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedStream")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn from_bytes_declares_length() {
        let stream = NamedStream::from_bytes("a.txt", "abc");
        assert_eq!(stream.name(), "a.txt");
        assert_eq!(stream.size(), 3);

        let mut out = String::new();
        stream.into_reader().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
    }

    #[tokio::test]
    async fn open_uses_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let stream = NamedStream::open(&path, "weights.bin").await.unwrap();
        assert_eq!(stream.size(), 1000);
    }
}
