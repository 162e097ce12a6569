//! Incremental tar encoding.
//!
//! The `tar` crate's builder wants a synchronous writer and the whole body up
//! front. Layers and daemon tarballs are produced from async streams, so only
//! the header blocks are built with `tar`; bodies, padding and the end marker
//! are written by the caller as the bytes arrive.

use std::io;

use tar::{EntryType, Header};
use wraptor_common::{WrapError, WrapResult};

/// Size of one tar block.
pub const BLOCK_SIZE: u64 = 512;

/// Two zero blocks terminate an archive.
pub const END_OF_ARCHIVE: [u8; 1024] = [0; 1024];

static ZERO_BLOCK: [u8; BLOCK_SIZE as usize] = [0; BLOCK_SIZE as usize];

/// Header block(s) for a regular file entry.
///
/// Long paths get a GNU long-name entry in front of the header, which is why
/// this can return more than one block.
pub fn file_header(path: &str, size: u64) -> WrapResult<Vec<u8>> {
    if path.is_empty() {
        return Err(WrapError::encoding("entry name is empty"));
    }

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    let mut builder = tar::Builder::new(Vec::with_capacity(BLOCK_SIZE as usize * 2));
    builder
        .append_data(&mut header, path, io::empty())
        .map_err(|e| WrapError::encoding(format!("invalid header for {path}: {e}")))?;

    // Dropping the builder appends the end marker to what is left behind.
    Ok(std::mem::take(builder.get_mut()))
}

/// Zero padding that follows a body of `size` bytes.
#[must_use]
pub fn padding(size: u64) -> &'static [u8] {
    let rem = size % BLOCK_SIZE;
    if rem == 0 {
        &[]
    } else {
        #[allow(clippy::cast_possible_truncation)]
        &ZERO_BLOCK[..(BLOCK_SIZE - rem) as usize]
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, body) in entries {
            out.extend(file_header(name, body.len() as u64).unwrap());
            out.extend_from_slice(body);
            out.extend_from_slice(padding(body.len() as u64));
        }
        out.extend_from_slice(&END_OF_ARCHIVE);
        out
    }

    #[test]
    fn readable_by_tar() {
        let bytes = archive(&[("a.txt", b"abc"), ("b.txt", b"")]);
        assert_eq!(bytes.len() % BLOCK_SIZE as usize, 0);

        let mut ar = tar::Archive::new(bytes.as_slice());
        let mut seen = Vec::new();
        for entry in ar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            assert_eq!(entry.header().mode().unwrap(), 0o644);
            seen.push((path, body));
        }
        assert_eq!(
            seen,
            vec![
                ("a.txt".to_string(), "abc".to_string()),
                ("b.txt".to_string(), String::new())
            ]
        );
    }

    #[test]
    fn long_names_survive() {
        let name = format!("models/{}/weights.safetensors", "x".repeat(150));
        let bytes = archive(&[(&name, b"1234")]);

        let mut ar = tar::Archive::new(bytes.as_slice());
        let entry = ar.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), name);
        assert_eq!(entry.size(), 4);
    }

    #[test]
    fn padding_lengths() {
        assert!(padding(0).is_empty());
        assert_eq!(padding(1).len(), 511);
        assert!(padding(1024).is_empty());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(file_header("", 0).is_err());
        assert!(file_header("../escape", 0).is_err());
    }
}
