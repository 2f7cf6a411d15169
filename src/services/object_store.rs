//! Object storage seam.
//!
//! `S3ObjectStore` talks to any S3-compatible endpoint; `MemoryObjectStore`
//! backs tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectCannedAcl, ObjectIdentifier};
use aws_sdk_s3::Client;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::ObjectStorageConfig;
use crate::error::{Error, Result};

pub const CONTENT_TYPE: &str = "binary/octet-stream";

/// Largest page S3 returns from a single list or accepts in one batch delete.
pub const MAX_PAGE: usize = 1000;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acl {
    #[default]
    Private,
    PublicRead,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, acl: Acl) -> Result<()>;

    /// Fails with [`Error::NotFound`] when the object is absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Up to `limit` keys under `prefix`, ascending, strictly after `start_after`.
    async fn list(&self, prefix: &str, start_after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    /// Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectStorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "cerberus-static",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);

        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(endpoint_url(&config.endpoint, config.use_ssl));
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

/// Add a scheme to bare `host:port` endpoints.
fn endpoint_url(endpoint: &str, use_ssl: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if use_ssl {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

fn s3_err(op: &str, e: impl std::error::Error) -> Error {
    Error::transient(format!("s3 {}: {}", op, DisplayErrorContext(e)))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, acl: Acl) -> Result<()> {
        let acl = match acl {
            Acl::Private => ObjectCannedAcl::Private,
            Acl::PublicRead => ObjectCannedAcl::PublicRead,
        };
        let len = body.len() as i64;

        tokio::time::timeout(
            CALL_TIMEOUT,
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(CONTENT_TYPE)
                .content_length(len)
                .acl(acl)
                .body(ByteStream::from(body))
                .send(),
        )
        .await?
        .map_err(|e| s3_err("put", e))?;

        debug!(key = %key, bytes = len, "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let output = tokio::time::timeout(
            CALL_TIMEOUT,
            self.client.get_object().bucket(&self.bucket).key(key).send(),
        )
        .await?;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    return Err(Error::NotFound);
                }
                return Err(s3_err("get", service_err));
            }
        };

        let body = tokio::time::timeout(CALL_TIMEOUT, output.body.collect())
            .await?
            .map_err(|e| Error::transient(format!("s3 get body: {}", e)))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str, start_after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let limit = limit.min(MAX_PAGE);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let output = tokio::time::timeout(
            CALL_TIMEOUT,
            self.client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(limit as i32)
                .set_start_after(start_after.map(str::to_string))
                .send(),
        )
        .await?
        .map_err(|e| s3_err("list", e))?;

        Ok(output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(MAX_PAGE) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::invalid(format!("s3 delete request: {}", e)))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| Error::invalid(format!("s3 delete request: {}", e)))?;

            let output = tokio::time::timeout(
                CALL_TIMEOUT,
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send(),
            )
            .await?
            .map_err(|e| s3_err("delete", e))?;

            if let Some(failed) = output.errors().first() {
                return Err(Error::transient(format!(
                    "s3 delete {}: {}",
                    failed.key().unwrap_or_default(),
                    failed.message().unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::timeout(
            CALL_TIMEOUT,
            self.client.head_bucket().bucket(&self.bucket).send(),
        )
        .await?
        .map_err(|e| s3_err("head bucket", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    acl: Acl,
}

/// In-process object store with failure injection.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failing_puts: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a transient error.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Successful puts so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|o| o.body.clone())
    }

    pub fn acl(&self, key: &str) -> Option<Acl> {
        self.objects.lock().get(key).map(|o| o.acl)
    }

    /// Overwrite an object's bytes in place, bypassing encryption.
    pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) {
        if let Some(object) = self.objects.lock().get_mut(key) {
            f(&mut object.body);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, acl: Acl) -> Result<()> {
        let failing = self.failing_puts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_puts.store(failing - 1, Ordering::SeqCst);
            return Err(Error::transient("memory store: injected put failure"));
        }
        self.objects
            .lock()
            .insert(key.to_string(), StoredObject { body, acl });
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(key)
            .map(|o| o.body.clone())
            .ok_or(Error::NotFound)
    }

    async fn list(&self, prefix: &str, start_after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let objects = self.objects.lock();
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| start_after.is_none_or(|after| k.as_str() > after))
            .take(limit.min(MAX_PAGE))
            .cloned()
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("minio:9000", false), "http://minio:9000");
        assert_eq!(endpoint_url("s3.example.com", true), "https://s3.example.com");
        assert_eq!(endpoint_url("http://localhost:9000", true), "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_memory_list_pages() {
        let store = MemoryObjectStore::new();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            store.put(key, vec![1], Acl::Private).await.unwrap();
        }

        let first = store.list("a/", None, 2).await.unwrap();
        assert_eq!(first, vec!["a/1", "a/2"]);
        let rest = store.list("a/", Some("a/2"), 2).await.unwrap();
        assert_eq!(rest, vec!["a/3"]);
    }

    #[tokio::test]
    async fn test_memory_injected_failure() {
        let store = MemoryObjectStore::new();
        store.fail_next_puts(1);
        assert!(store.put("k", vec![], Acl::Private).await.is_err());
        assert!(store.put("k", vec![], Acl::Private).await.is_ok());
        assert_eq!(store.put_count(), 1);
        assert!(matches!(store.get("missing").await, Err(Error::NotFound)));
    }
}
