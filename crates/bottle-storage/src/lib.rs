//! Peer-addressable document storage used as a rendezvous medium.
//!
//! Every peer owns one address root. A client may read documents under any
//! root but may only write or delete under its own. Backends ship for an
//! in-process medium (tests, simulations), a shared directory, and an HTTP
//! hub that speaks plain `GET`/`PUT`/`DELETE`.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod fs;
pub mod http;
pub mod memory;

pub use fs::FsStorage;
pub use http::HttpStorage;
pub use memory::{MemoryMedium, MemoryStorage};

/// Opaque identifier of a peer's storage root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, StorageError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(StorageError::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.0
    }
}

impl std::str::FromStr for PeerAddress {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Location of one document: an address root plus relative segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoragePath {
    root: PeerAddress,
    segments: Vec<String>,
}

impl StoragePath {
    pub fn new<I, S>(root: PeerAddress, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root,
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.segments.push(segment.into());
        next
    }

    pub fn root(&self) -> &PeerAddress {
        &self.root
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.segments.is_empty() {
            return Err(StorageError::InvalidPath {
                path: self.to_string(),
                reason: "path has no segments",
            });
        }
        for segment in &self.segments {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StorageError::InvalidPath {
                    path: self.to_string(),
                    reason: "empty or relative segment",
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.root.as_str())?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
    #[error("invalid storage path {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{path} is outside the writable root {root}")]
    ReadOnly { path: String, root: PeerAddress },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed document at {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} for {path}: {body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        path: String,
        body: String,
    },
}

/// Asynchronous document store keyed by [`StoragePath`].
///
/// `read` distinguishes "not found" (`Ok(None)`) from failures. Writes and
/// deletes outside [`StorageClient::self_address`] fail with
/// [`StorageError::ReadOnly`]; deleting a missing document succeeds.
#[async_trait]
pub trait StorageClient: Send + Sync {
    fn self_address(&self) -> &PeerAddress;

    async fn read(&self, path: &StoragePath) -> Result<Option<Value>, StorageError>;

    async fn write(&self, path: &StoragePath, document: &Value) -> Result<(), StorageError>;

    async fn delete(&self, path: &StoragePath) -> Result<(), StorageError>;
}

/// Reads a document and deserializes it into `T`.
pub async fn read_json<T>(
    storage: &dyn StorageClient,
    path: &StoragePath,
) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
{
    match storage.read(path).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                path: path.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Serializes `value` and writes it at `path`.
pub async fn write_json<T>(
    storage: &dyn StorageClient,
    path: &StoragePath,
    value: &T,
) -> Result<(), StorageError>
where
    T: Serialize + ?Sized,
{
    let document = serde_json::to_value(value).map_err(|source| StorageError::Decode {
        path: path.to_string(),
        source,
    })?;
    storage.write(path, &document).await
}

pub(crate) fn ensure_writable(owner: &PeerAddress, path: &StoragePath) -> Result<(), StorageError> {
    path.validate()?;
    if path.root() != owner {
        return Err(StorageError::ReadOnly {
            path: path.to_string(),
            root: owner.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(value: &str) -> PeerAddress {
        PeerAddress::new(value).unwrap()
    }

    #[test]
    fn rejects_blank_addresses() {
        assert!(matches!(
            PeerAddress::new("   "),
            Err(StorageError::InvalidAddress(_))
        ));
        assert!(PeerAddress::new("").is_err());
        assert_eq!(addr("alice.id").as_str(), "alice.id");
    }

    #[test]
    fn address_deserialization_is_validated() {
        let parsed: PeerAddress = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(parsed, addr("bob"));
        assert!(serde_json::from_str::<PeerAddress>("\"\"").is_err());
    }

    #[test]
    fn paths_render_root_and_segments() {
        let path = StoragePath::new(addr("alice"), ["bob", "messages"]).join("block.json");
        assert_eq!(path.to_string(), "alice/bob/messages/block.json");
        assert_eq!(path.segments().len(), 3);
    }

    #[test]
    fn writes_outside_own_root_are_rejected() {
        let owner = addr("alice");
        let foreign = StoragePath::new(addr("bob"), ["signal.json"]);
        assert!(matches!(
            ensure_writable(&owner, &foreign),
            Err(StorageError::ReadOnly { .. })
        ));
        let own = StoragePath::new(owner.clone(), ["signal.json"]);
        assert!(ensure_writable(&owner, &own).is_ok());
        let relative = StoragePath::new(owner.clone(), [".."]);
        assert!(matches!(
            ensure_writable(&owner, &relative),
            Err(StorageError::InvalidPath { .. })
        ));
    }
}
