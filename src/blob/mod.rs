//! Blob fetcher.
//!
//! Streams package archives out of blob storage into temp files under the
//! cache directory, hashing as the bytes arrive. The archive's recorded
//! SHA-256 is authoritative: a mismatch fails the fetch and nothing
//! downstream ever observes unverified bytes.

pub mod dir;
pub mod http;

use std::io::Write;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

pub use dir::DirBlobFetcher;
pub use http::{HttpBlobConfig, HttpBlobFetcher};

/// A fully fetched, hash-verified archive sitting in a temp file.
#[derive(Debug)]
pub struct FetchedBlob {
    /// Temp file holding the archive bytes; deleted on drop unless persisted
    pub file: NamedTempFile,
    /// Computed SHA-256 (hex) over the archive bytes
    pub sha256: String,
    /// Archive size in bytes
    pub size: u64,
}

/// Contract for pulling package archives out of blob storage.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Fetch `package_path`, verifying the hash (and size when
    /// `expected_size` is non-zero) as bytes stream in.
    async fn fetch(
        &self,
        package_path: &str,
        expected_hash: &str,
        expected_size: u64,
    ) -> Result<FetchedBlob>;
}

/// Incremental sink: spools bytes to a temp file while hashing and counting.
pub(crate) struct HashingSink {
    file: NamedTempFile,
    hasher: Sha256,
    bytes: u64,
}

impl HashingSink {
    /// Create a sink spooling into `spool_dir` (the cache directory, so the
    /// final rename stays on one filesystem).
    pub fn new(spool_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(spool_dir)?;
        let file = NamedTempFile::new_in(spool_dir)?;
        Ok(Self {
            file,
            hasher: Sha256::new(),
            bytes: 0,
        })
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        self.file.as_file_mut().write_all(chunk)?;
        Ok(())
    }

    /// Finish the stream, enforcing the recorded fingerprint.
    pub fn finish(
        self,
        package_path: &str,
        expected_hash: &str,
        expected_size: u64,
    ) -> Result<FetchedBlob> {
        let actual = format!("{:x}", self.hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_hash) {
            return Err(Error::HashMismatch {
                path: package_path.to_string(),
                expected: expected_hash.to_string(),
                actual,
            });
        }
        if expected_size != 0 && self.bytes != expected_size {
            return Err(Error::SizeMismatch {
                path: package_path.to_string(),
                expected: expected_size,
                actual: self.bytes,
            });
        }
        let mut file = self.file;
        file.as_file_mut().flush()?;
        Ok(FetchedBlob {
            file,
            sha256: actual,
            size: self.bytes,
        })
    }
}

/// SHA-256 (hex) of a byte slice. Shared by tests and the cache's
/// re-verification path.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sink_detects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = HashingSink::new(dir.path()).unwrap();
        sink.write_chunk(b"not the advertised bytes").unwrap();
        let err = sink.finish("p.tar.gz", &"00".repeat(32), 0).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
    }

    #[test]
    fn test_sink_detects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = HashingSink::new(dir.path()).unwrap();
        sink.write_chunk(b"abc").unwrap();
        let expected = sha256_hex(b"abc");
        let err = sink.finish("p.tar.gz", &expected, 99).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 99, actual: 3, .. }));
    }

    #[test]
    fn test_sink_accepts_matching_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = HashingSink::new(dir.path()).unwrap();
        sink.write_chunk(b"ab").unwrap();
        sink.write_chunk(b"c").unwrap();
        let blob = sink.finish("p.tar.gz", &sha256_hex(b"abc"), 3).unwrap();
        assert_eq!(blob.size, 3);
        assert_eq!(std::fs::read(blob.file.path()).unwrap(), b"abc");
    }
}
