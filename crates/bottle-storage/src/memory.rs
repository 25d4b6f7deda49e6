use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::{ensure_writable, PeerAddress, StorageClient, StorageError, StoragePath};

/// Shared in-process medium. Every [`MemoryStorage`] created from the same
/// medium sees the same documents.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    inner: Arc<MediumInner>,
}

#[derive(Default)]
struct MediumInner {
    documents: RwLock<BTreeMap<String, Value>>,
    offline: AtomicBool,
    read_only: AtomicBool,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client bound to `address` as its writable root.
    pub fn client(&self, address: PeerAddress) -> MemoryStorage {
        MemoryStorage {
            medium: self.clone(),
            address,
        }
    }

    /// While unavailable every operation fails with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.offline.store(!available, Ordering::SeqCst);
    }

    /// While rejecting writes, reads still succeed but writes and deletes fail.
    pub fn set_writes_rejected(&self, rejected: bool) {
        self.inner.read_only.store(rejected, Ordering::SeqCst);
    }

    pub fn get(&self, path: &StoragePath) -> Option<Value> {
        self.inner.documents.read().get(&path.to_string()).cloned()
    }

    pub fn insert(&self, path: &StoragePath, document: Value) {
        self.inner
            .documents
            .write()
            .insert(path.to_string(), document);
    }

    /// Keys currently stored under `prefix`, in lexical order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .documents
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory medium offline".into()));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), StorageError> {
        self.check_available()?;
        if self.inner.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory medium rejecting writes".into(),
            ));
        }
        Ok(())
    }
}

/// [`StorageClient`] view of a [`MemoryMedium`].
#[derive(Clone)]
pub struct MemoryStorage {
    medium: MemoryMedium,
    address: PeerAddress,
}

impl MemoryStorage {
    pub fn medium(&self) -> &MemoryMedium {
        &self.medium
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    fn self_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn read(&self, path: &StoragePath) -> Result<Option<Value>, StorageError> {
        self.medium.check_available()?;
        Ok(self.medium.get(path))
    }

    async fn write(&self, path: &StoragePath, document: &Value) -> Result<(), StorageError> {
        ensure_writable(&self.address, path)?;
        self.medium.check_writes()?;
        self.medium.insert(path, document.clone());
        Ok(())
    }

    async fn delete(&self, path: &StoragePath) -> Result<(), StorageError> {
        ensure_writable(&self.address, path)?;
        self.medium.check_writes()?;
        self.medium
            .inner
            .documents
            .write()
            .remove(&path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(value: &str) -> PeerAddress {
        PeerAddress::new(value).unwrap()
    }

    #[tokio::test]
    async fn peers_share_documents_but_write_only_their_root() {
        let medium = MemoryMedium::new();
        let alice = medium.client(addr("alice"));
        let bob = medium.client(addr("bob"));
        let path = StoragePath::new(addr("alice"), ["signal.json"]);

        alice.write(&path, &json!({"hello": 1})).await.unwrap();
        assert_eq!(bob.read(&path).await.unwrap(), Some(json!({"hello": 1})));

        let err = bob.write(&path, &json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly { .. }));
        let err = bob.delete(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly { .. }));
    }

    #[tokio::test]
    async fn missing_documents_read_as_none() {
        let medium = MemoryMedium::new();
        let alice = medium.client(addr("alice"));
        let path = StoragePath::new(addr("bob"), ["signal.json"]);
        assert_eq!(alice.read(&path).await.unwrap(), None);
        let own = StoragePath::new(addr("alice"), ["gone.json"]);
        alice.delete(&own).await.unwrap();
    }

    #[tokio::test]
    async fn offline_medium_reports_unavailable() {
        let medium = MemoryMedium::new();
        let alice = medium.client(addr("alice"));
        let path = StoragePath::new(addr("alice"), ["signal.json"]);
        medium.set_available(false);
        assert!(matches!(
            alice.read(&path).await,
            Err(StorageError::Unavailable(_))
        ));
        medium.set_available(true);
        medium.set_writes_rejected(true);
        assert!(alice.read(&path).await.is_ok());
        assert!(matches!(
            alice.write(&path, &json!(1)).await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
