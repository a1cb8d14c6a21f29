//! Blob store backends.

use crate::{BackendError, BackendResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Key of the object that replaces an offloaded payload.
pub const BLOB_MARKER: &str = "$blob";

/// Backend-tagged reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    pub blob_id: String,
    /// Backend that holds the bytes (`memory`, `fs`).
    pub backend: String,
    /// Hex-encoded SHA-256 of the content.
    pub sha256: String,
    pub size: u64,
    pub mime: String,
    pub uploaded_at: DateTime<Utc>,
    /// Backend-specific location (a file path for `fs`).
    pub locator: String,
}

impl BlobRef {
    fn describe(bytes: &[u8], backend: &str, mime: &str, locator: impl FnOnce(&str) -> String) -> Self {
        let blob_id = uuid::Uuid::new_v4().to_string();
        let locator = locator(&blob_id);
        Self {
            blob_id,
            backend: backend.to_string(),
            sha256: hex::encode(Sha256::digest(bytes)),
            size: bytes.len() as u64,
            mime: mime.to_string(),
            uploaded_at: Utc::now(),
            locator,
        }
    }

    /// Whether `bytes` match the recorded digest.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        hex::encode(Sha256::digest(bytes)) == self.sha256
    }

    /// Payload stand-in carried on the wire: `{"$blob": <ref>}`.
    pub fn to_marker(&self) -> BackendResult<serde_json::Value> {
        let mut marker = serde_json::Map::new();
        marker.insert(BLOB_MARKER.to_string(), serde_json::to_value(self)?);
        Ok(serde_json::Value::Object(marker))
    }

    /// Extract the reference from an offloaded payload.
    pub fn from_marker(payload: &serde_json::Value) -> Option<Self> {
        let inner = payload.as_object()?.get(BLOB_MARKER)?;
        serde_json::from_value(inner.clone()).ok()
    }
}

/// Opaque byte storage addressed by blob ID.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend tag recorded in every `BlobRef`.
    fn backend(&self) -> &'static str;

    /// Store `bytes` and return a reference to them.
    async fn store(&self, bytes: Vec<u8>, mime: &str) -> BackendResult<BlobRef>;

    /// Read a blob back.
    async fn fetch(&self, blob_id: &str) -> BackendResult<Vec<u8>>;

    /// Delete a blob. Returns `false` if it did not exist.
    async fn delete(&self, blob_id: &str) -> BackendResult<bool>;

    /// Check whether a blob exists.
    async fn exists(&self, blob_id: &str) -> BackendResult<bool>;
}

/// In-process blob store.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (BlobRef, Vec<u8>)>>,
    available: AtomicBool,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; every call fails with `Unavailable` while down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory blob store is down".to_string()))
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, bytes: Vec<u8>, mime: &str) -> BackendResult<BlobRef> {
        self.check_available()?;
        let blob = BlobRef::describe(&bytes, self.backend(), mime, |id| format!("memory://{}", id));
        self.blobs
            .write()
            .insert(blob.blob_id.clone(), (blob.clone(), bytes));
        Ok(blob)
    }

    async fn fetch(&self, blob_id: &str) -> BackendResult<Vec<u8>> {
        self.check_available()?;
        self.blobs
            .read()
            .get(blob_id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| BackendError::NotFound(blob_id.to_string()))
    }

    async fn delete(&self, blob_id: &str) -> BackendResult<bool> {
        self.check_available()?;
        Ok(self.blobs.write().remove(blob_id).is_some())
    }

    async fn exists(&self, blob_id: &str) -> BackendResult<bool> {
        self.check_available()?;
        Ok(self.blobs.read().contains_key(blob_id))
    }
}

/// Blob store keeping one file per blob, plus a `.json` sidecar holding its `BlobRef`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, blob_id: &str) -> BackendResult<PathBuf> {
        // Blob IDs are generated UUIDs; anything else could escape the root.
        let valid = !blob_id.is_empty()
            && blob_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(BackendError::NotFound(blob_id.to_string()));
        }
        Ok(self.root.join(blob_id))
    }

    fn meta_path(&self, blob_id: &str) -> BackendResult<PathBuf> {
        Ok(self.data_path(blob_id)?.with_extension("json"))
    }
}

fn not_found_as(err: std::io::Error, blob_id: &str) -> BackendError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BackendError::NotFound(blob_id.to_string())
    } else {
        BackendError::Io(err)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn backend(&self) -> &'static str {
        "fs"
    }

    async fn store(&self, bytes: Vec<u8>, mime: &str) -> BackendResult<BlobRef> {
        tokio::fs::create_dir_all(&self.root).await?;

        let root = self.root.clone();
        let blob = BlobRef::describe(&bytes, self.backend(), mime, |id| {
            root.join(id).display().to_string()
        });

        tokio::fs::write(self.data_path(&blob.blob_id)?, &bytes).await?;
        tokio::fs::write(
            self.meta_path(&blob.blob_id)?,
            serde_json::to_vec_pretty(&blob)?,
        )
        .await?;

        debug!(blob_id = %blob.blob_id, size = blob.size, "Stored blob");
        Ok(blob)
    }

    async fn fetch(&self, blob_id: &str) -> BackendResult<Vec<u8>> {
        let meta = tokio::fs::read(self.meta_path(blob_id)?)
            .await
            .map_err(|e| not_found_as(e, blob_id))?;
        let blob: BlobRef = serde_json::from_slice(&meta)?;

        let bytes = tokio::fs::read(self.data_path(blob_id)?)
            .await
            .map_err(|e| not_found_as(e, blob_id))?;
        if !blob.verify(&bytes) {
            return Err(BackendError::Integrity(blob_id.to_string()));
        }
        Ok(bytes)
    }

    async fn delete(&self, blob_id: &str) -> BackendResult<bool> {
        let existed = self.exists(blob_id).await?;
        for path in [self.data_path(blob_id)?, self.meta_path(blob_id)?] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(existed)
    }

    async fn exists(&self, blob_id: &str) -> BackendResult<bool> {
        let path = match self.data_path(blob_id) {
            Ok(path) => path,
            Err(BackendError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(tokio::fs::try_exists(path).await?)
    }
}
