//! Local-directory blob fetcher.
//!
//! Resolves package paths inside a root directory. Used for standalone
//! deployments and tests; the same hash authority applies.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

use super::{BlobFetcher, FetchedBlob, HashingSink};

/// Serves archives from a local directory tree.
pub struct DirBlobFetcher {
    root: PathBuf,
    spool_dir: PathBuf,
}

impl DirBlobFetcher {
    /// `root` holds the archives; `spool_dir` receives temp copies.
    pub fn new(root: impl Into<PathBuf>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            spool_dir: spool_dir.into(),
        }
    }

    /// Join `package_path` under the root, rejecting traversal components.
    fn resolve(&self, package_path: &str) -> Result<PathBuf> {
        let relative = Path::new(package_path);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => {
                    return Err(Error::blob_transport(
                        package_path,
                        "package path may not contain traversal components",
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobFetcher for DirBlobFetcher {
    async fn fetch(
        &self,
        package_path: &str,
        expected_hash: &str,
        expected_size: u64,
    ) -> Result<FetchedBlob> {
        let source = self.resolve(package_path)?;
        debug!(package_path, source = %source.display(), "fetching archive from local tree");

        let data = tokio::fs::read(&source)
            .await
            .map_err(|_| Error::BlobNotFound(package_path.to_string()))?;

        let mut sink = HashingSink::new(&self.spool_dir)?;
        sink.write_chunk(&data)?;
        sink.finish(package_path, expected_hash, expected_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::sha256_hex;

    #[tokio::test]
    async fn test_dir_fetch_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let spool = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("fn-1")).unwrap();
        std::fs::write(root.path().join("fn-1/1.tar.gz"), b"tarball").unwrap();

        let fetcher = DirBlobFetcher::new(root.path(), spool.path());
        let blob = fetcher
            .fetch("fn-1/1.tar.gz", &sha256_hex(b"tarball"), 7)
            .await
            .unwrap();
        assert_eq!(blob.size, 7);
    }

    #[tokio::test]
    async fn test_dir_fetch_rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        let spool = tempfile::tempdir().unwrap();
        let fetcher = DirBlobFetcher::new(root.path(), spool.path());

        let err = fetcher.fetch("../etc/passwd", "aa", 0).await.unwrap_err();
        assert!(matches!(err, Error::BlobTransport { .. }));
    }

    #[tokio::test]
    async fn test_dir_fetch_missing_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let spool = tempfile::tempdir().unwrap();
        let fetcher = DirBlobFetcher::new(root.path(), spool.path());

        let err = fetcher.fetch("nope.tar.gz", "aa", 0).await.unwrap_err();
        assert!(matches!(err, Error::BlobNotFound(_)));
    }
}
