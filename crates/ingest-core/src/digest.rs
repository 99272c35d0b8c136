//! Provider-native digest algorithms.
//!
//! Three digests are produced from one pass over a byte stream:
//!
//! - the plain MD5 of the whole content,
//! - the S3 multipart entity tag for a given chunk size (MD5 of each chunk; a
//!   single chunk yields its plain hex digest, N > 1 chunks yield
//!   `hex(md5(concat(raw chunk digests)))-N`),
//! - the GCS CRC32C (Castagnoli), carried as base64 of its big-endian bytes and,
//!   for key prefixes, as an unsigned decimal.
//!
//! Chunk boundaries are counted in bytes consumed, so the read buffer size of the
//! caller never changes the result.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest as _, Md5};

use crate::error::{Error, Result};

/// Default chunk size, matching the AWS CLI multipart threshold/chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const READ_BUF_MAX: usize = 1024 * 1024;

/// Incremental S3 multipart entity tag.
#[derive(Clone)]
pub struct MultipartTag {
    chunk_size: usize,
    current: Md5,
    current_len: usize,
    parts: Vec<[u8; 16]>,
}

impl MultipartTag {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            current: Md5::new(),
            current_len: 0,
            parts: Vec::new(),
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = self.chunk_size - self.current_len;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take;
            data = &data[take..];
            if self.current_len == self.chunk_size {
                self.seal_part();
            }
        }
    }

    fn seal_part(&mut self) {
        let digest = std::mem::replace(&mut self.current, Md5::new()).finalize();
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&digest);
        self.parts.push(raw);
        self.current_len = 0;
    }

    /// Number of chunks seen so far, counting a trailing partial chunk.
    pub fn part_count(&self) -> usize {
        self.parts.len() + usize::from(self.current_len > 0)
    }

    pub fn finalize(mut self) -> String {
        if self.current_len > 0 {
            self.seal_part();
        }
        match self.parts.len() {
            0 => hex::encode(Md5::digest(b"")),
            1 => hex::encode(self.parts[0]),
            n => {
                let mut outer = Md5::new();
                for part in &self.parts {
                    outer.update(part);
                }
                format!("{}-{}", hex::encode(outer.finalize()), n)
            }
        }
    }
}

/// Running CRC32C.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32c(u32);

impl Crc32c {
    pub fn update(&mut self, data: &[u8]) {
        self.0 = crc32c::crc32c_append(self.0, data);
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Base64 of the big-endian 4-byte CRC32C, as GCS reports it.
pub fn crc32c_to_base64(value: u32) -> String {
    STANDARD.encode(value.to_be_bytes())
}

pub fn crc32c_from_base64(encoded: &str) -> Result<u32> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Digest(format!("crc32c '{encoded}' is not base64: {e}")))?;
    let raw: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Digest(format!("crc32c '{encoded}' is not 4 bytes")))?;
    Ok(u32::from_be_bytes(raw))
}

/// GCS reports MD5 as base64; the manifest carries hex.
pub fn md5_base64_to_hex(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Digest(format!("md5 '{encoded}' is not base64: {e}")))?;
    if bytes.len() != 16 {
        return Err(Error::Digest(format!("md5 '{encoded}' is not 16 bytes")));
    }
    Ok(hex::encode(bytes))
}

/// A plain (non-multipart) MD5 hex string.
pub fn is_plain_md5(tag: &str) -> bool {
    tag.len() == 32 && tag.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Which digests a pass should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigestSelection {
    pub md5: bool,
    pub multipart_tag: bool,
    pub crc32c: bool,
}

impl DigestSelection {
    pub const ALL: DigestSelection = DigestSelection {
        md5: true,
        multipart_tag: true,
        crc32c: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.md5 || self.multipart_tag || self.crc32c)
    }
}

/// Finished digests. Fields not selected stay `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Digests {
    pub md5: Option<String>,
    pub multipart_tag: Option<String>,
    pub crc32c: Option<u32>,
    pub bytes: u64,
}

impl Digests {
    pub fn crc32c_base64(&self) -> Option<String> {
        self.crc32c.map(crc32c_to_base64)
    }
}

/// All selected digests, fed in one pass.
#[derive(Clone)]
pub struct MultiDigest {
    md5: Option<Md5>,
    tag: Option<MultipartTag>,
    crc: Option<Crc32c>,
    bytes: u64,
}

impl MultiDigest {
    pub fn new(chunk_size: usize, selection: DigestSelection) -> Self {
        Self {
            md5: selection.md5.then(Md5::new),
            tag: selection.multipart_tag.then(|| MultipartTag::new(chunk_size)),
            crc: selection.crc32c.then(Crc32c::default),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(md5) = self.md5.as_mut() {
            md5.update(data);
        }
        if let Some(tag) = self.tag.as_mut() {
            tag.update(data);
        }
        if let Some(crc) = self.crc.as_mut() {
            crc.update(data);
        }
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Digests {
        Digests {
            md5: self.md5.map(|m| hex::encode(m.finalize())),
            multipart_tag: self.tag.map(MultipartTag::finalize),
            crc32c: self.crc.map(Crc32c::value),
            bytes: self.bytes,
        }
    }
}

/// Digest failure, split the way row outcomes need it.
#[derive(Debug)]
pub enum DigestError {
    /// The source could not be opened at all.
    Unavailable(io::Error),
    /// Reading stopped part way; nothing should be recorded.
    Interrupted { bytes_read: u64, source: io::Error },
}

impl std::fmt::Display for DigestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestError::Unavailable(e) => write!(f, "source unavailable: {e}"),
            DigestError::Interrupted { bytes_read, source } => {
                write!(f, "read failed after {bytes_read} bytes: {source}")
            }
        }
    }
}

impl std::error::Error for DigestError {}

/// Stream `reader` to the end, producing the selected digests.
pub fn digest_reader<R: Read>(
    mut reader: R,
    chunk_size: usize,
    selection: DigestSelection,
) -> std::result::Result<Digests, DigestError> {
    let mut state = MultiDigest::new(chunk_size, selection);
    let mut buf = vec![0u8; chunk_size.clamp(1, READ_BUF_MAX)];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => state.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(DigestError::Interrupted {
                    bytes_read: state.bytes(),
                    source,
                })
            }
        }
    }
    Ok(state.finish())
}

/// A reader that digests everything passing through it.
pub struct DigestingReader<R> {
    inner: R,
    state: MultiDigest,
}

impl<R: Read> DigestingReader<R> {
    pub fn new(inner: R, chunk_size: usize, selection: DigestSelection) -> Self {
        Self {
            inner,
            state: MultiDigest::new(chunk_size, selection),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.state.bytes()
    }

    pub fn finish(self) -> Digests {
        self.state.finish()
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.state.update(&buf[..n]);
        Ok(n)
    }
}

/// CRC32C values keyed by source path, used to build GCS key prefixes.
#[derive(Debug, Default)]
pub struct Crc32cIndex {
    values: Mutex<HashMap<String, u32>>,
}

impl Crc32cIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: &str, value: u32) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.to_string(), value);
    }

    /// Record from the manifest's base64 form.
    pub fn record_base64(&self, source: &str, encoded: &str) -> Result<u32> {
        let value = crc32c_from_base64(encoded)?;
        self.record(source, value);
        Ok(value)
    }

    pub fn get(&self, source: &str) -> Option<u32> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
