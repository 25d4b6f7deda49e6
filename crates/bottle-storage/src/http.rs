use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{ensure_writable, PeerAddress, StorageClient, StorageError, StoragePath};

/// Hub-style HTTP medium: documents live at `<hub>/<address>/<segments...>`.
///
/// `GET` returning 404 reads as "not found", `PUT` stores a JSON document and
/// `DELETE` removes one. An optional bearer token is attached to every request.
#[derive(Clone)]
pub struct HttpStorage {
    http: Client,
    base_url: Url,
    address: PeerAddress,
    token: Option<String>,
}

impl HttpStorage {
    pub fn new(base_url: &str, address: PeerAddress) -> Result<Self, StorageError> {
        let base_url = Url::parse(base_url).map_err(|_| StorageError::InvalidPath {
            path: base_url.to_string(),
            reason: "hub url is not a valid absolute url",
        })?;
        if base_url.cannot_be_a_base() {
            return Err(StorageError::InvalidPath {
                path: base_url.to_string(),
                reason: "hub url cannot be a base",
            });
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            address,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url_for(&self, path: &StoragePath) -> Result<Url, StorageError> {
        path.validate()?;
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| StorageError::InvalidPath {
                path: path.to_string(),
                reason: "hub url cannot be a base",
            })?;
            segments.pop_if_empty();
            segments.push(path.root().as_str());
            segments.extend(path.segments());
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn unexpected(path: &StoragePath, response: reqwest::Response) -> StorageError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StorageError::UnexpectedStatus {
        status,
        path: path.to_string(),
        body,
    }
}

#[async_trait]
impl StorageClient for HttpStorage {
    fn self_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn read(&self, path: &StoragePath) -> Result<Option<Value>, StorageError> {
        let url = self.url_for(path)?;
        let response = self.authorize(self.http.get(url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|source| StorageError::Decode {
                        path: path.to_string(),
                        source,
                    })
            }
            status if status.is_server_error() => {
                debug!(target = "bottle_storage::http", path = %path, %status, "hub read failed");
                Err(StorageError::Unavailable(format!(
                    "hub returned {status} for {path}"
                )))
            }
            _ => Err(unexpected(path, response).await),
        }
    }

    async fn write(&self, path: &StoragePath, document: &Value) -> Result<(), StorageError> {
        ensure_writable(&self.address, path)?;
        let url = self.url_for(path)?;
        let response = self
            .authorize(self.http.put(url))
            .json(document)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(path, response).await)
        }
    }

    async fn delete(&self, path: &StoragePath) -> Result<(), StorageError> {
        ensure_writable(&self.address, path)?;
        let url = self.url_for(path)?;
        let response = self.authorize(self.http.delete(url)).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(unexpected(path, response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    type Documents = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    async fn get_doc(
        State(docs): State<Documents>,
        Path(key): Path<String>,
    ) -> Result<Vec<u8>, AxumStatus> {
        docs.lock()
            .await
            .get(&key)
            .cloned()
            .ok_or(AxumStatus::NOT_FOUND)
    }

    async fn put_doc(
        State(docs): State<Documents>,
        Path(key): Path<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumStatus {
        if let Some(auth) = headers.get("authorization") {
            if auth != "Bearer hub-token" {
                return AxumStatus::UNAUTHORIZED;
            }
        }
        docs.lock().await.insert(key, body.to_vec());
        AxumStatus::NO_CONTENT
    }

    async fn delete_doc(State(docs): State<Documents>, Path(key): Path<String>) -> AxumStatus {
        match docs.lock().await.remove(&key) {
            Some(_) => AxumStatus::NO_CONTENT,
            None => AxumStatus::NOT_FOUND,
        }
    }

    async fn spawn_hub() -> (String, Documents) {
        let docs: Documents = Arc::new(Mutex::new(HashMap::new()));
        let app = Router::new()
            .route("/hub/*key", get(get_doc).put(put_doc).delete(delete_doc))
            .with_state(docs.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hub/"), docs)
    }

    fn addr(value: &str) -> PeerAddress {
        PeerAddress::new(value).unwrap()
    }

    #[tokio::test]
    async fn reads_writes_and_deletes_against_hub() {
        let (base, docs) = spawn_hub().await;
        let alice = HttpStorage::new(&base, addr("alice"))
            .unwrap()
            .with_token("hub-token");
        let bob = HttpStorage::new(&base, addr("bob")).unwrap();
        let path = StoragePath::new(addr("alice"), ["signal.json"]);

        assert_eq!(bob.read(&path).await.unwrap(), None);
        alice.write(&path, &json!({"role": "initiator"})).await.unwrap();
        assert!(docs.lock().await.contains_key("alice/signal.json"));
        assert_eq!(
            bob.read(&path).await.unwrap(),
            Some(json!({"role": "initiator"}))
        );

        alice.delete(&path).await.unwrap();
        alice.delete(&path).await.unwrap();
        assert_eq!(bob.read(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_writes_surface_status() {
        let (base, _docs) = spawn_hub().await;
        let alice = HttpStorage::new(&base, addr("alice"))
            .unwrap()
            .with_token("wrong");
        let path = StoragePath::new(addr("alice"), ["signal.json"]);
        let err = alice.write(&path, &json!({})).await.unwrap_err();
        match err {
            StorageError::UnexpectedStatus { status, .. } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn urls_encode_address_and_segments() {
        let storage = HttpStorage::new("http://hub.local/store", addr("alice")).unwrap();
        let url = storage
            .url_for(&StoragePath::new(addr("bob smith"), ["a/b", "c.json"]))
            .unwrap();
        assert_eq!(url.as_str(), "http://hub.local/store/bob%20smith/a%2Fb/c.json");
    }
}
