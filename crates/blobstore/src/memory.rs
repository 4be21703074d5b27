//! In-process blob store
//!
//! Keeps blobs in a map guarded by a mutex. Besides serving as an embeddable
//! backend it records every write and can simulate an unreachable remote,
//! which is what the publisher and watcher tests lean on.

use crate::{BlobProperties, BlobStore, Error, Result, validate_path};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
struct MemoryBlob {
    bytes: Vec<u8>,
    properties: BlobProperties,
    last_modified: DateTime<Utc>,
}

/// A write observed by a [`MemoryBlobStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Container written to
    pub container: String,
    /// Blob path written
    pub path: String,
    /// Payload size in bytes
    pub size: usize,
    /// Properties attached to the write
    pub properties: BlobProperties,
}

/// Blob store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<(String, String), MemoryBlob>>,
    writes: Mutex<Vec<WriteRecord>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    stat_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a blob without recording it as a write
    pub fn seed(
        &self,
        container: &str,
        path: &str,
        bytes: impl Into<Vec<u8>>,
        properties: BlobProperties,
        last_modified: DateTime<Utc>,
    ) {
        self.blobs.lock().insert(
            (container.to_string(), path.to_string()),
            MemoryBlob {
                bytes: bytes.into(),
                properties,
                last_modified,
            },
        );
    }

    /// Overwrite the last-modified timestamp of an existing blob
    ///
    /// Returns `false` when the blob does not exist.
    pub fn set_last_modified(&self, container: &str, path: &str, at: DateTime<Utc>) -> bool {
        let mut blobs = self.blobs.lock();
        match blobs.get_mut(&(container.to_string(), path.to_string())) {
            Some(blob) => {
                blob.last_modified = at;
                true
            }
            None => false,
        }
    }

    /// Make every read-side operation fail as if the remote were unreachable
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write-side operation fail as if the remote were unreachable
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every operation by the given duration
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// All writes recorded so far, oldest first
    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    /// Number of writes recorded so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Number of `last_modified` queries served (including failed ones)
    #[must_use]
    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    /// Raw bytes of a blob, bypassing fault injection
    #[must_use]
    pub fn get(&self, container: &str, path: &str) -> Option<(Vec<u8>, BlobProperties)> {
        self.blobs
            .lock()
            .get(&(container.to_string(), path.to_string()))
            .map(|blob| (blob.bytes.clone(), blob.properties.clone()))
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_reads(&self, operation: &str, container: &str, path: &str) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::unavailable(
                operation,
                container,
                path,
                "simulated outage",
            ));
        }
        Ok(())
    }

    fn key(container: &str, path: &str) -> (String, String) {
        (container.to_string(), path.to_string())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, container: &str, path: &str) -> Result<bool> {
        self.simulate_latency().await;
        self.check_reads("exists", container, path)?;
        Ok(self.blobs.lock().contains_key(&Self::key(container, path)))
    }

    async fn last_modified(&self, container: &str, path: &str) -> Result<DateTime<Utc>> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_reads("last_modified", container, path)?;
        self.blobs
            .lock()
            .get(&Self::key(container, path))
            .map(|blob| blob.last_modified)
            .ok_or_else(|| Error::not_found(container, path))
    }

    async fn read_bytes(&self, container: &str, path: &str) -> Result<Option<Vec<u8>>> {
        self.simulate_latency().await;
        self.check_reads("read", container, path)?;
        Ok(self
            .blobs
            .lock()
            .get(&Self::key(container, path))
            .map(|blob| blob.bytes.clone()))
    }

    async fn properties(&self, container: &str, path: &str) -> Result<Option<BlobProperties>> {
        self.simulate_latency().await;
        self.check_reads("properties", container, path)?;
        Ok(self
            .blobs
            .lock()
            .get(&Self::key(container, path))
            .map(|blob| blob.properties.clone()))
    }

    async fn write_bytes(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        properties: &BlobProperties,
    ) -> Result<()> {
        validate_path(path)?;
        self.simulate_latency().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::unavailable(
                "write",
                container,
                path,
                "simulated outage",
            ));
        }

        let key = Self::key(container, path);
        let mut blobs = self.blobs.lock();
        // Keep timestamps strictly increasing so a rewrite is always observable
        let mut last_modified = Utc::now();
        if let Some(previous) = blobs.get(&key)
            && last_modified <= previous.last_modified
        {
            last_modified = previous.last_modified + ChronoDuration::milliseconds(1);
        }
        blobs.insert(
            key,
            MemoryBlob {
                bytes: bytes.to_vec(),
                properties: properties.clone(),
                last_modified,
            },
        );
        drop(blobs);

        trace!(container, path, size = bytes.len(), "memory blob written");
        self.writes.lock().push(WriteRecord {
            container: container.to_string(),
            path: path.to_string(),
            size: bytes.len(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn delete(&self, container: &str, path: &str) -> Result<()> {
        self.simulate_latency().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::unavailable(
                "delete",
                container,
                path,
                "simulated outage",
            ));
        }
        self.blobs.lock().remove(&Self::key(container, path));
        Ok(())
    }

    async fn list_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        self.simulate_latency().await;
        self.check_reads("list", container, prefix)?;
        Ok(self
            .blobs
            .lock()
            .keys()
            .filter(|(c, p)| c == container && p.starts_with(prefix))
            .map(|(_, p)| p.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_text() {
        let store = MemoryBlobStore::new();
        store
            .write_text("assets", "css/site.css", "body{}", &BlobProperties::new("text/css"))
            .await
            .unwrap();

        assert!(store.exists("assets", "css/site.css").await.unwrap());
        assert_eq!(
            store.read_text("assets", "css/site.css").await.unwrap(),
            Some("body{}".to_string())
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn paths_are_case_sensitive() {
        let store = MemoryBlobStore::new();
        store
            .write_text("assets", "css/site.css", "a", &BlobProperties::new("text/css"))
            .await
            .unwrap();
        assert!(!store.exists("assets", "CSS/Site.css").await.unwrap());
    }

    #[tokio::test]
    async fn rewrite_advances_last_modified() {
        let store = MemoryBlobStore::new();
        let props = BlobProperties::new("text/javascript");
        store.write_text("c", "app.js", "1", &props).await.unwrap();
        let first = store.last_modified("c", "app.js").await.unwrap();
        store.write_text("c", "app.js", "2", &props).await.unwrap();
        let second = store.last_modified("c", "app.js").await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn missing_blob_last_modified_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.last_modified("c", "nope.js").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn simulated_outage_fails_reads_but_not_seed() {
        let store = MemoryBlobStore::new();
        store.seed("c", "a.js", "x", BlobProperties::new("text/javascript"), Utc::now());
        store.set_fail_reads(true);

        assert!(store.read_text("c", "a.js").await.is_err());
        assert!(store.last_modified("c", "a.js").await.is_err());
        assert_eq!(store.stat_calls(), 1);
        assert!(store.get("c", "a.js").is_some());
    }

    #[tokio::test]
    async fn list_and_delete_prefix() {
        let store = MemoryBlobStore::new();
        let props = BlobProperties::new("text/css");
        for path in ["css/a.css", "css/compressed/a.css", "js/b.js"] {
            store.write_text("c", path, "x", &props).await.unwrap();
        }

        let listed = store.list_by_prefix("c", "css/").await.unwrap();
        assert_eq!(listed, vec!["css/a.css", "css/compressed/a.css"]);

        let removed = store.delete_prefix("c", "css/").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.exists("c", "js/b.js").await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_is_not_recorded() {
        let store = MemoryBlobStore::new();
        store.set_fail_writes(true);
        let result = store
            .write_text("c", "a.css", "x", &BlobProperties::new("text/css"))
            .await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));
        assert_eq!(store.write_count(), 0);
    }
}
