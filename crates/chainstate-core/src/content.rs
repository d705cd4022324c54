//! Content-addressed blob storage.
//!
//! Checkpoint snapshots are pushed to a [`ContentStore`] and referenced by
//! the address the store returns. Addresses are `sha256:<hex digest>` of the
//! blob, so any reader can verify what it fetched.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::IndexerError;

/// Prefix of every content address.
pub const ADDRESS_PREFIX: &str = "sha256:";

/// Compute the content address of `bytes`.
pub fn content_address(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{ADDRESS_PREFIX}{}", hex::encode(digest))
}

/// Returns `Ok(())` if `bytes` hash to `address`.
pub fn verify(address: &str, bytes: &[u8]) -> Result<(), IndexerError> {
    let actual = content_address(bytes);
    if actual != address {
        return Err(IndexerError::ContentStore(format!(
            "content mismatch: expected {address}, got {actual}"
        )));
    }
    Ok(())
}

/// Put/get byte-blob service addressed by content hash.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes` and return their content address.
    async fn put(&self, bytes: Vec<u8>) -> Result<String, IndexerError>;

    /// Fetch the blob at `address`.
    async fn get(&self, address: &str) -> Result<Vec<u8>, IndexerError>;
}

/// In-memory content store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, IndexerError> {
        let address = content_address(&bytes);
        self.blobs
            .lock()
            .map_err(|e| IndexerError::ContentStore(e.to_string()))?
            .insert(address.clone(), bytes);
        Ok(address)
    }

    async fn get(&self, address: &str) -> Result<Vec<u8>, IndexerError> {
        self.blobs
            .lock()
            .map_err(|e| IndexerError::ContentStore(e.to_string()))?
            .get(address)
            .cloned()
            .ok_or_else(|| IndexerError::NotFound(format!("content {address}")))
    }
}
