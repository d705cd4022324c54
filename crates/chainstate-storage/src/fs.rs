//! Filesystem content store.
//!
//! Blobs live under `<root>/<first two hex chars>/<digest>`. Writes go to a
//! temporary file that is renamed into place, so a crash never leaves a
//! half-written blob under a valid address.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use chainstate_core::content::{content_address, verify, ContentStore, ADDRESS_PREFIX};
use chainstate_core::error::IndexerError;

fn io_err(e: std::io::Error) -> IndexerError {
    IndexerError::ContentStore(e.to_string())
}

/// [`ContentStore`] writing blobs into a local directory.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Use `root` as the blob directory, creating it if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(io_err)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, address: &str) -> Result<PathBuf, IndexerError> {
        let digest = address
            .strip_prefix(ADDRESS_PREFIX)
            .filter(|d| d.len() > 2 && d.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| IndexerError::ContentStore(format!("malformed address '{address}'")))?;
        Ok(self.root.join(&digest[..2]).join(digest))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, IndexerError> {
        let address = content_address(&bytes);
        let path = self.path_for(&address)?;
        if tokio::fs::try_exists(&path).await.map_err(io_err)? {
            return Ok(address);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!(address = %address, bytes = bytes.len(), "blob stored");
        Ok(address)
    }

    async fn get(&self, address: &str) -> Result<Vec<u8>, IndexerError> {
        let path = self.path_for(address)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexerError::NotFound(format!("blob {address}")));
            }
            Err(e) => return Err(io_err(e)),
        };
        verify(address, &bytes)?;
        Ok(bytes)
    }
}
