//! Bounded buffered readers, chunk filling and file digests.
//!
//! Local sources are always read through a `BufReader` with an explicit capacity
//! so a checksum or upload worker holds at most one chunk in flight.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use ingest_core::digest::{digest_reader, DigestError, DigestSelection, Digests};

/// Read-buffer cap for local files.
pub const LOCAL_READ_CAPACITY: usize = 1024 * 1024;

/// A thin wrapper over `BufReader` with a fixed capacity to bound in-flight bytes.
pub struct BoundedBufReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> BoundedBufReader<R> {
    /// Create a new bounded reader with a maximum internal buffer size.
    pub fn with_capacity(capacity: usize, reader: R) -> Self {
        Self {
            inner: BufReader::with_capacity(capacity, reader),
        }
    }

    /// Access the underlying buffer length (bytes currently buffered).
    pub fn buffer_len(&self) -> usize {
        self.inner.buffer().len()
    }
}

impl<R: Read> Read for BoundedBufReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read> BufRead for BoundedBufReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }
    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

/// Convenience helper to create a bounded reader from a file path.
pub fn bounded_from_path<P: AsRef<Path>>(
    path: P,
    cap: usize,
) -> io::Result<BoundedBufReader<File>> {
    let file = File::open(path)?;
    Ok(BoundedBufReader::with_capacity(cap, file))
}

/// Read until `size` bytes are collected or the reader is exhausted.
/// A short (or empty) result means end of input.
pub fn read_chunk<R: Read + ?Sized>(reader: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(size.min(64 * 1024 * 1024));
    reader.take(size as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

/// Digest a local file in one pass.
pub fn digest_path<P: AsRef<Path>>(
    path: P,
    chunk_size: usize,
    selection: DigestSelection,
) -> Result<Digests, DigestError> {
    let reader = bounded_from_path(path, LOCAL_READ_CAPACITY).map_err(DigestError::Unavailable)?;
    digest_reader(reader, chunk_size, selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn read_chunk_fills_then_drains() {
        let mut src = Cursor::new(vec![1u8; 10]);
        assert_eq!(read_chunk(&mut src, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut src, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut src, 4).unwrap().len(), 2);
        assert!(read_chunk(&mut src, 4).unwrap().is_empty());
    }

    #[test]
    fn digest_path_reports_missing_file_as_unavailable() {
        let err = digest_path("/definitely/not/here.bin", 16, DigestSelection::ALL).unwrap_err();
        assert!(matches!(err, DigestError::Unavailable(_)));
    }

    #[test]
    fn digest_path_hashes_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        let digests = digest_path(file.path(), 16, DigestSelection::ALL).unwrap();
        assert_eq!(
            digests.md5.as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(digests.multipart_tag, digests.md5);
        assert_eq!(digests.bytes, 3);
    }
}
