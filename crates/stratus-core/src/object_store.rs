//! Object store interface
//!
//! The store holds opaque blobs: stored query parameters, catalog
//! fragments, aggregated catalog pages. Artifacts are written under
//! keys and read back by the URI returned from `put_json`; the core
//! never inspects worker result payloads.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Result, ServiceError};

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store a JSON document under `key`, returning the URI it can be
    /// read back from.
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<String>;

    /// Fetch a JSON document by the URI a previous put returned.
    async fn get_json(&self, uri: &str) -> Result<serde_json::Value>;

    /// The URI a `put_json(key, ..)` call will return, without writing.
    fn uri_for(&self, key: &str) -> String;
}

/// In-memory object store used by tests
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<String> {
        let uri = self.uri_for(key);
        self.objects.write().insert(uri.clone(), value.clone());
        Ok(uri)
    }

    async fn get_json(&self, uri: &str) -> Result<serde_json::Value> {
        self.objects
            .read()
            .get(uri)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("object {uri}")))
    }

    fn uri_for(&self, key: &str) -> String {
        format!("mem://{key}")
    }
}

/// Local-filesystem object store
///
/// Keys map to paths under a root directory. Suitable for single-node
/// deployments and development; production deployments substitute an
/// implementation backed by a shared store.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<String> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::server(format!("object store mkdir: {e}")))?;
        }
        let body = serde_json::to_vec(value)
            .map_err(|e| ServiceError::server(format!("object store encode: {e}")))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ServiceError::server(format!("object store write: {e}")))?;
        Ok(self.uri_for(key))
    }

    async fn get_json(&self, uri: &str) -> Result<serde_json::Value> {
        let key = uri
            .strip_prefix("file://")
            .ok_or_else(|| ServiceError::validation(format!("not a file URI: {uri}")))?;
        let body = tokio::fs::read(key)
            .await
            .map_err(|_| ServiceError::NotFound(format!("object {uri}")))?;
        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::server(format!("object store decode: {e}")))
    }

    fn uri_for(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryObjectStore::new();
        let uri = store
            .put_json("jobs/1/item0.json", &json!({"hello": "world"}))
            .await
            .unwrap();
        assert_eq!(uri, "mem://jobs/1/item0.json");
        let value = store.get_json(&uri).await.unwrap();
        assert_eq!(value, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get_json("mem://nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
