use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::{ensure_writable, PeerAddress, StorageClient, StorageError, StoragePath};

/// Directory-backed medium, e.g. a folder replicated between machines.
///
/// Each address root is a subdirectory of `base`; segments are
/// form-urlencoded so arbitrary addresses map onto safe file names.
#[derive(Debug, Clone)]
pub struct FsStorage {
    base: PathBuf,
    address: PeerAddress,
}

impl FsStorage {
    pub fn new(base: impl Into<PathBuf>, address: PeerAddress) -> Self {
        Self {
            base: base.into(),
            address,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn file_path(&self, path: &StoragePath) -> Result<PathBuf, StorageError> {
        path.validate()?;
        let mut file = self.base.join(encode_segment(path.root().as_str()));
        for segment in path.segments() {
            file.push(encode_segment(segment));
        }
        Ok(file)
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

fn io_error(path: &StoragePath) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_string(),
        source,
    }
}

#[async_trait]
impl StorageClient for FsStorage {
    fn self_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn read(&self, path: &StoragePath) -> Result<Option<Value>, StorageError> {
        let file = self.file_path(path)?;
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(path)(err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                path: path.to_string(),
                source,
            })
    }

    async fn write(&self, path: &StoragePath, document: &Value) -> Result<(), StorageError> {
        ensure_writable(&self.address, path)?;
        let file = self.file_path(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(path))?;
        }
        let bytes = serde_json::to_vec(document).map_err(|source| StorageError::Decode {
            path: path.to_string(),
            source,
        })?;
        let tmp = file.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(io_error(path))?;
        if let Err(err) = tokio::fs::rename(&tmp, &file).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path)(err));
        }
        trace!(target = "bottle_storage::fs", path = %path, bytes = bytes.len(), "document written");
        Ok(())
    }

    async fn delete(&self, path: &StoragePath) -> Result<(), StorageError> {
        ensure_writable(&self.address, path)?;
        let file = self.file_path(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(path)(err)),
        }
    }
}
