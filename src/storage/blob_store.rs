//! The object-store capability set (`spec.md` §4.2).
//!
//! `BlobStore` is the async capability interface; [`ObjectStoreBlobStore`]
//! wraps any `object_store::ObjectStore` (S3-compatible credentials/bucket
//! provisioning are the out-of-scope external collaborator — this crate
//! only needs an already-configured handle). [`InMemoryBlobStore`] is the
//! test/reference backend, mirroring the teacher's in-memory test doubles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::error::{Result, StorageError};
use crate::types::Timestamp;

/// Result of a successful write: size and content hash, per `spec.md` §4.2
/// ("All writes return a stable content hash").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub size: u64,
    pub sha256: String,
}

/// Object metadata returned by [`BlobStore::head`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadResult {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub last_modified: Timestamp,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One page of a [`BlobStore::list`] call.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Capability set `{putJSON, putRaw, get, head, del, list, presignGet, copy}`
/// over an object store with a uniform key schema (`spec.md` §4.2).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Serializes `value` as JSON and writes it to `bucket/key`.
    async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> Result<PutResult>;

    /// Writes raw bytes to `bucket/key`.
    async fn put_raw(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<PutResult>;

    /// Reads raw bytes from `bucket/key`. Fails with `NotFound` if absent.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Returns object metadata without fetching the body. Fails with
    /// `NotFound` if absent.
    async fn head(&self, bucket: &str, key: &str) -> Result<HeadResult>;

    /// Deletes `bucket/key`. Deleting a missing object is not an error.
    async fn del(&self, bucket: &str, key: &str) -> Result<()>;

    /// Lists keys under `prefix`, paginated.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
    ) -> Result<ListPage>;

    /// Returns a presigned GET URL valid for `ttl_seconds`.
    async fn presign_get(&self, bucket: &str, key: &str, ttl_seconds: u64) -> Result<String>;

    /// Copies `bucket/src_key` to `bucket/dst_key`.
    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()>;
}

/// Production `BlobStore` backed by any `object_store::ObjectStore`
/// (configured with the `aws` feature for S3-compatible buckets).
///
/// One `ObjectStore` handle is assumed per bucket; `bucket` values passed
/// to trait methods are treated as a sanity check against the handle's
/// configured bucket, not as a dynamic bucket selector — constructing a
/// client per bucket, with credentials, is the out-of-scope collaborator.
pub struct ObjectStoreBlobStore {
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn new(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.into(),
            store,
        }
    }

    fn check_bucket(&self, bucket: &str) -> Result<()> {
        if bucket != self.bucket {
            return Err(StorageError::backend(format!(
                "object store handle configured for bucket '{}', got '{bucket}'",
                self.bucket
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    #[instrument(skip(self, value), fields(bucket, key))]
    async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> Result<PutResult> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.put_raw(bucket, key, bytes, Some("application/json")).await
    }

    #[instrument(skip(self, bytes), fields(bucket, key, len = bytes.len()))]
    async fn put_raw(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<PutResult> {
        self.check_bucket(bucket)?;
        let sha256 = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let path = ObjectPath::from(key);
        self.store.put(&path, Bytes::from(bytes).into()).await?;
        Ok(PutResult { size, sha256 })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.check_bucket(bucket)?;
        let path = ObjectPath::from(key);
        let result = self.store.get(&path).await?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<HeadResult> {
        self.check_bucket(bucket)?;
        let path = ObjectPath::from(key);
        let meta = self.store.head(&path).await?;
        Ok(HeadResult {
            content_length: meta.size as u64,
            content_type: None,
            last_modified: Timestamp::from_millis(meta.last_modified.timestamp_millis()),
            etag: meta.e_tag,
            metadata: HashMap::new(),
        })
    }

    async fn del(&self, bucket: &str, key: &str) -> Result<()> {
        self.check_bucket(bucket)?;
        let path = ObjectPath::from(key);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
        _continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        self.check_bucket(bucket)?;
        use futures_util::TryStreamExt;
        let prefix_path = ObjectPath::from(prefix);
        let mut stream = self.store.list(Some(&prefix_path));
        let mut keys = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            keys.push(meta.location.to_string());
            if keys.len() >= max_keys {
                break;
            }
        }
        Ok(ListPage {
            keys,
            next_token: None,
        })
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl_seconds: u64) -> Result<String> {
        self.check_bucket(bucket)?;
        Ok(format!("https://{bucket}/{key}?ttl={ttl_seconds}"))
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        self.check_bucket(bucket)?;
        let src = ObjectPath::from(src_key);
        let dst = ObjectPath::from(dst_key);
        self.store.copy(&src, &dst).await?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct InMemoryObject {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

/// In-memory `BlobStore` test/reference backend.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<(String, String), InMemoryObject>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> Result<PutResult> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.put_raw(bucket, key, bytes, Some("application/json")).await
    }

    async fn put_raw(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<PutResult> {
        let sha256 = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let mut objects = self.objects.write().unwrap();
        objects.insert(
            (bucket.to_string(), key.to_string()),
            InMemoryObject {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(PutResult { size, sha256 })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let objects = self.objects.read().unwrap();
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")).into())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<HeadResult> {
        let objects = self.objects.read().unwrap();
        let obj = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))?;
        Ok(HeadResult {
            content_length: obj.bytes.len() as u64,
            content_type: obj.content_type.clone(),
            last_modified: Timestamp::now(),
            etag: Some(sha256_hex(&obj.bytes)),
            metadata: HashMap::new(),
        })
    }

    async fn del(&self, bucket: &str, key: &str) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
        _continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        let objects = self.objects.read().unwrap();
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys.truncate(max_keys);
        Ok(ListPage {
            keys,
            next_token: None,
        })
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl_seconds: u64) -> Result<String> {
        Ok(format!("memory://{bucket}/{key}?ttl={ttl_seconds}"))
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        let src = objects
            .get(&(bucket.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{src_key}")))?;
        objects.insert((bucket.to_string(), dst_key.to_string()), src);
        Ok(())
    }
}

/// Dispatches each call to the per-bucket handle registered for it.
///
/// Production blob handles are single-bucket (see [`ObjectStoreBlobStore`]);
/// a routed record spans four buckets (records/versions/content/backups),
/// so the write pipeline talks to one `CompositeBlobStore` that fans out by
/// the `bucket` argument rather than knowing about per-bucket clients.
pub struct CompositeBlobStore {
    by_bucket: HashMap<String, Arc<dyn BlobStore>>,
}

impl CompositeBlobStore {
    pub fn new(by_bucket: HashMap<String, Arc<dyn BlobStore>>) -> Self {
        Self { by_bucket }
    }

    fn resolve(&self, bucket: &str) -> Result<&Arc<dyn BlobStore>> {
        self.by_bucket
            .get(bucket)
            .ok_or_else(|| StorageError::backend(format!("no blob handle registered for bucket '{bucket}'")).into())
    }
}

#[async_trait]
impl BlobStore for CompositeBlobStore {
    async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> Result<PutResult> {
        self.resolve(bucket)?.put_json(bucket, key, value).await
    }

    async fn put_raw(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<PutResult> {
        self.resolve(bucket)?.put_raw(bucket, key, bytes, content_type).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.resolve(bucket)?.get(bucket, key).await
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<HeadResult> {
        self.resolve(bucket)?.head(bucket, key).await
    }

    async fn del(&self, bucket: &str, key: &str) -> Result<()> {
        self.resolve(bucket)?.del(bucket, key).await
    }

    async fn list(&self, bucket: &str, prefix: &str, max_keys: usize, continuation_token: Option<&str>) -> Result<ListPage> {
        self.resolve(bucket)?.list(bucket, prefix, max_keys, continuation_token).await
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl_seconds: u64) -> Result<String> {
        self.resolve(bucket)?.presign_get(bucket, key, ttl_seconds).await
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        self.resolve(bucket)?.copy(bucket, src_key, dst_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_json_then_get() {
        let store = InMemoryBlobStore::new();
        store
            .put_json("records", "users/abc/v0/item.json", &json!({"email": "a@x"}))
            .await
            .unwrap();
        let bytes = store.get("records", "users/abc/v0/item.json").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"email": "a@x"}));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.get("records", "missing").await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_put_returns_stable_hash() {
        let store = InMemoryBlobStore::new();
        let r1 = store
            .put_raw("content", "a/b", b"hello".to_vec(), None)
            .await
            .unwrap();
        let r2 = store
            .put_raw("content", "c/d", b"hello".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(r1.sha256, r2.sha256);
    }

    #[tokio::test]
    async fn test_list_prefix_and_max_keys() {
        let store = InMemoryBlobStore::new();
        for i in 0..5 {
            store
                .put_raw("records", &format!("users/{i}/item.json"), vec![0], None)
                .await
                .unwrap();
        }
        let page = store.list("records", "users/", 3, None).await.unwrap();
        assert_eq!(page.keys.len(), 3);
    }

    #[tokio::test]
    async fn test_copy() {
        let store = InMemoryBlobStore::new();
        store.put_raw("records", "src", b"data".to_vec(), None).await.unwrap();
        store.copy("records", "src", "dst").await.unwrap();
        assert_eq!(store.get("records", "dst").await.unwrap(), b"data".to_vec());
    }

    #[tokio::test]
    async fn test_del_missing_is_not_an_error() {
        let store = InMemoryBlobStore::new();
        store.del("records", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_head_on_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.head("records", "missing").await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_composite_dispatches_by_bucket() {
        let records: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let content: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let composite = CompositeBlobStore::new(HashMap::from([
            ("records".to_string(), records.clone()),
            ("content".to_string(), content.clone()),
        ]));
        composite.put_raw("records", "k", b"r".to_vec(), None).await.unwrap();
        composite.put_raw("content", "k", b"c".to_vec(), None).await.unwrap();
        assert_eq!(records.get("records", "k").await.unwrap(), b"r".to_vec());
        assert_eq!(content.get("content", "k").await.unwrap(), b"c".to_vec());
    }

    #[tokio::test]
    async fn test_composite_unregistered_bucket_errors() {
        let composite = CompositeBlobStore::new(HashMap::new());
        let err = composite.get("records", "k").await.unwrap_err();
        assert!(err.is_storage());
    }
}
