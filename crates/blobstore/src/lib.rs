//! Blob store capability interface for bundlecdn
//!
//! This crate defines the narrow set of remote object-store operations the
//! bundle publisher and dependency watcher rely on:
//! - Existence and last-modified queries
//! - Text and byte reads
//! - Writes carrying content type, cache control and content encoding
//! - Deletion and prefix listing
//!
//! Two backends ship with the crate: [`MemoryBlobStore`] for tests and
//! embedding, and [`FsBlobStore`] which lays containers out as directories on
//! local disk.

// TODO(blobstore-docs): Add # Errors documentation to all fallible public functions
#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

mod error;
pub mod fs;
pub mod memory;

pub use error::{Error, Result};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content encoding recorded on gzip-compressed blobs
pub const GZIP_ENCODING: &str = "gzip";

/// HTTP-facing metadata stored alongside a blob
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobProperties {
    /// MIME type served for the blob
    pub content_type: String,
    /// Cache-Control header value, e.g. `public, max-age=3600`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// Content-Encoding header value, `gzip` for compressed payloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
}

impl BlobProperties {
    /// Properties with only a content type set
    #[must_use]
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            cache_control: None,
            content_encoding: None,
        }
    }

    /// Properties with the content type implied by the path's extension.
    ///
    /// Unknown extensions map to `application/octet-stream`.
    #[must_use]
    pub fn for_path(path: &str) -> Self {
        let extension = std::path::Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let content_type = match extension.as_deref() {
            Some("png") => "image/png",
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("css") => "text/css",
            Some("htm" | "html") => "text/html",
            Some("js") => "text/javascript",
            Some("xml") => "text/xml",
            _ => "application/octet-stream",
        };
        Self::new(content_type)
    }

    /// Set a public cache-control max-age
    #[must_use]
    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.cache_control = Some(format!("public, max-age={seconds}"));
        self
    }

    /// Mark the payload as gzip encoded
    #[must_use]
    pub fn gzip(mut self) -> Self {
        self.content_encoding = Some(GZIP_ENCODING.to_string());
        self
    }

    /// Whether the payload is gzip encoded
    #[must_use]
    pub fn is_gzip(&self) -> bool {
        self.content_encoding.as_deref() == Some(GZIP_ENCODING)
    }
}

/// Remote object store operations, addressed per `(container, path)`.
///
/// Paths are compared case-sensitively, as the remote store does.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Check whether a blob exists
    async fn exists(&self, container: &str, path: &str) -> Result<bool>;

    /// Last-modified timestamp of a blob
    ///
    /// Returns [`Error::NotFound`] when the blob does not exist.
    async fn last_modified(&self, container: &str, path: &str) -> Result<DateTime<Utc>>;

    /// Read a blob's raw bytes, `None` when it does not exist
    async fn read_bytes(&self, container: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Read the stored properties of a blob, `None` when it does not exist
    async fn properties(&self, container: &str, path: &str) -> Result<Option<BlobProperties>>;

    /// Write raw bytes, replacing any existing blob
    async fn write_bytes(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        properties: &BlobProperties,
    ) -> Result<()>;

    /// Delete a blob; deleting a missing blob is not an error
    async fn delete(&self, container: &str, path: &str) -> Result<()>;

    /// List blob paths under a prefix, sorted
    async fn list_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>>;

    /// Read a blob as UTF-8 text, `None` when it does not exist
    async fn read_text(&self, container: &str, path: &str) -> Result<Option<String>> {
        match self.read_bytes(container, path).await? {
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
                Error::unavailable("read_text", container, path, format!("not UTF-8: {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Write UTF-8 text, replacing any existing blob
    async fn write_text(
        &self,
        container: &str,
        path: &str,
        content: &str,
        properties: &BlobProperties,
    ) -> Result<()> {
        self.write_bytes(container, path, content.as_bytes(), properties)
            .await
    }

    /// Delete every blob under a prefix, returning how many were removed
    async fn delete_prefix(&self, container: &str, prefix: &str) -> Result<usize> {
        let paths = self.list_by_prefix(container, prefix).await?;
        for path in &paths {
            self.delete(container, path).await?;
        }
        Ok(paths.len())
    }
}

/// Reject paths that could escape their container
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_path(path, "path is empty"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(Error::invalid_path(path, "path must be relative"));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(Error::invalid_path(path, "path must not contain '..'"));
    }
    Ok(())
}
