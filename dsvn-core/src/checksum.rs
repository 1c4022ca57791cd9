//! Checksums for file content
//!
//! Every text that crosses the wire carries two digests computed from the
//! same byte stream:
//! - a SHA-256 [`ContentId`], the key of the content-addressed pristine store
//! - an [`Md5Digest`], required by the tree-edit protocol to anchor deltas

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N], hex::FromHexError> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != N {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// SHA-256 content address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Create a new ContentId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the content address of `data`
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        decode_fixed(hex_str).map(Self)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// MD5 digest, the protocol-level text checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        decode_fixed(hex_str).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Both checksums of one text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChecksumPair {
    pub md5: Md5Digest,
    pub sha256: ContentId,
}

impl ChecksumPair {
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = DualHasher::new();
        hasher.update(data);
        hasher.finish()
    }
}

/// Computes MD5 and SHA-256 in a single pass
#[derive(Clone)]
pub struct DualHasher {
    md5: md5::Context,
    sha256: Sha256,
    len: u64,
}

impl DualHasher {
    pub fn new() -> Self {
        Self {
            md5: md5::Context::new(),
            sha256: Sha256::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.consume(data);
        self.sha256.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> ChecksumPair {
        ChecksumPair {
            md5: Md5Digest(self.md5.compute().0),
            sha256: ContentId(self.sha256.finalize().into()),
        }
    }
}

impl Default for DualHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader adapter that checksums everything read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: DualHasher,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: DualHasher::new(),
        }
    }

    pub fn finish(self) -> (R, ChecksumPair) {
        (self.inner, self.hasher.finish())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer adapter that checksums everything written through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: DualHasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: DualHasher::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.hasher.len()
    }

    pub fn finish(self) -> (W, ChecksumPair) {
        (self.inner, self.hasher.finish())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_hex_roundtrip() {
        let id = ContentId::from_data(b"hello world");
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(ContentId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(ContentId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_md5_known_value() {
        let digest = Md5Digest::from_data(b"");
        assert_eq!(digest.to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_dual_hasher_matches_one_shot() {
        let data = b"line one\nline two\n";
        let mut hasher = DualHasher::new();
        hasher.update(&data[..5]);
        hasher.update(&data[5..]);
        assert_eq!(hasher.len(), data.len() as u64);
        let pair = hasher.finish();
        assert_eq!(pair.md5, Md5Digest::from_data(data));
        assert_eq!(pair.sha256, ContentId::from_data(data));
    }

    #[test]
    fn test_hashing_reader_and_writer_agree() {
        let data = vec![7u8; 10_000];
        let mut reader = HashingReader::new(&data[..]);
        let mut writer = HashingWriter::new(Vec::new());
        io::copy(&mut reader, &mut writer).unwrap();
        let (_, read_sums) = reader.finish();
        let (out, write_sums) = writer.finish();
        assert_eq!(out, data);
        assert_eq!(read_sums, write_sums);
        assert_eq!(read_sums, ChecksumPair::from_data(&data));
    }
}
