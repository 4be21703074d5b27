//! Content-addressed publishing of bundle artifacts
//!
//! The publisher writes to the remote store only when freshly generated
//! content differs from what is stored there. Remote reads act as the diff
//! baseline; a failing read counts as "absent" and leads to a fresh publish,
//! while a failing write fails the request.

use crate::compress::{CompressedVariant, Compressor};
use crate::config::BundleConfig;
use crate::identity::{ArtifactLayout, BundleIdentity, ContentType};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bundlecdn_blobstore::{BlobProperties, BlobStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How the requesting client wants the artifact delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Client sent `Accept-Encoding` containing `gzip`
    pub accept_gzip: bool,
    /// Bundles are served through the CDN
    pub use_cdn: bool,
}

impl Delivery {
    /// Derive delivery options from an `Accept-Encoding` header value
    #[must_use]
    pub fn from_accept_encoding(accept_encoding: Option<&str>, use_cdn: bool) -> Self {
        Self {
            accept_gzip: accept_encoding
                .is_some_and(|value| value.to_ascii_lowercase().contains("gzip")),
            use_cdn,
        }
    }
}

/// Form in which the compressed sibling was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressedForm {
    /// Gzip payload with `Content-Encoding: gzip`
    Gzip,
    /// Original bytes; compression was skipped
    Original,
}

/// What a publish call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// Remote paths of the plain artifact and compressed sibling
    pub layout: ArtifactLayout,
    /// The plain artifact was (re)written
    pub plain_written: bool,
    /// The compressed sibling was (re)written, and in which form
    pub compressed_written: Option<CompressedForm>,
    /// Remote path the client should be served from
    pub served_path: String,
    /// Versioned CDN URL, when CDN delivery is enabled
    pub cdn_url: Option<String>,
}

impl PublishOutcome {
    /// Number of remote writes performed
    #[must_use]
    pub fn write_count(&self) -> usize {
        usize::from(self.plain_written) + usize::from(self.compressed_written.is_some())
    }

    /// Where this outcome directs the client
    #[must_use]
    pub fn location(&self) -> ServedLocation {
        ServedLocation {
            path: self.served_path.clone(),
            cdn_url: self.cdn_url.clone(),
        }
    }
}

/// Remote path and CDN URL a client is directed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServedLocation {
    /// Remote path of the served artifact
    pub path: String,
    /// Versioned CDN URL, when CDN delivery is enabled
    pub cdn_url: Option<String>,
}

/// Publishes bundle artifacts to a blob store
#[derive(Clone)]
pub struct ArtifactPublisher {
    store: Arc<dyn BlobStore>,
    config: Arc<BundleConfig>,
    compressor: Compressor,
}

impl std::fmt::Debug for ArtifactPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPublisher")
            .field("container", &self.config.container)
            .field("compressor", &self.compressor)
            .finish_non_exhaustive()
    }
}

impl ArtifactPublisher {
    /// Create a publisher with the default compressor
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, config: Arc<BundleConfig>) -> Self {
        Self::with_compressor(store, config, Compressor::default())
    }

    /// Create a publisher with a custom compressor
    #[must_use]
    pub fn with_compressor(
        store: Arc<dyn BlobStore>,
        config: Arc<BundleConfig>,
        compressor: Compressor,
    ) -> Self {
        Self {
            store,
            config,
            compressor,
        }
    }

    /// The bundle configuration this publisher writes with
    #[must_use]
    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// Publish freshly generated bundle content.
    ///
    /// Writes the plain artifact (and, with compression enabled, its
    /// compressed sibling) only when the stored plain artifact differs. For
    /// gzip-accepting requests the compressed sibling is re-checked and
    /// rewritten if it differs from the expected payload.
    #[instrument(
        name = "publish_bundle",
        skip(self, content),
        fields(virtual_path = %identity.virtual_path, container = %identity.container)
    )]
    pub async fn publish(
        &self,
        identity: &BundleIdentity,
        content: &str,
        content_type: ContentType,
        delivery: Delivery,
    ) -> Result<PublishOutcome> {
        let container = identity.container.as_str();
        let layout = ArtifactLayout::for_bundle(&identity.virtual_path, content_type);
        let compression_on = self.config.use_compression && content_type.is_compressible();

        let mut outcome = PublishOutcome {
            served_path: layout.plain.clone(),
            layout,
            plain_written: false,
            compressed_written: None,
            cdn_url: None,
        };

        let stored = self.read_text_baseline(container, &outcome.layout.plain).await;
        let mut variant: Option<CompressedVariant> = None;

        if stored.as_deref() == Some(content) {
            debug!(path = %outcome.layout.plain, "Remote artifact unchanged, skipping upload");
        } else {
            self.write(
                container,
                &outcome.layout.plain,
                content.as_bytes(),
                &self.properties(content_type),
                "write plain artifact",
            )
            .await?;
            outcome.plain_written = true;

            if compression_on {
                variant = self.compressor.variant(content.as_bytes(), content_type)?;
                if let Some(v) = &variant {
                    self.write_variant(container, &outcome.layout.compressed, v, content_type)
                        .await?;
                    outcome.compressed_written = Some(form_of(v));
                }
            }
        }

        let mut served_bytes = content.as_bytes().to_vec();
        if delivery.accept_gzip && compression_on {
            let v = match variant {
                Some(v) => v,
                None => match self.compressor.variant(content.as_bytes(), content_type)? {
                    Some(v) => v,
                    None => return Ok(self.finish(identity, outcome, &served_bytes, delivery)),
                },
            };

            if outcome.compressed_written.is_none() {
                let stored = self
                    .read_bytes_baseline(container, &outcome.layout.compressed)
                    .await;
                if stored.as_deref() == Some(v.bytes.as_slice()) {
                    debug!(path = %outcome.layout.compressed, "Compressed artifact unchanged");
                } else {
                    self.write_variant(container, &outcome.layout.compressed, &v, content_type)
                        .await?;
                    outcome.compressed_written = Some(form_of(&v));
                }
            }

            outcome.served_path = outcome.layout.compressed.clone();
            served_bytes = v.bytes;
        }

        Ok(self.finish(identity, outcome, &served_bytes, delivery))
    }

    /// Write the compressed sibling if it does not exist yet.
    ///
    /// Used when a cached response is served to a gzip-accepting client.
    /// Returns whether a write happened.
    #[instrument(
        name = "ensure_compressed",
        skip(self, content),
        fields(virtual_path = %identity.virtual_path)
    )]
    pub async fn ensure_compressed(
        &self,
        identity: &BundleIdentity,
        content: &str,
        content_type: ContentType,
    ) -> Result<bool> {
        if !self.config.use_compression || !content_type.is_compressible() {
            return Ok(false);
        }

        let container = identity.container.as_str();
        let layout = ArtifactLayout::for_bundle(&identity.virtual_path, content_type);
        let exists = match self.store.exists(container, &layout.compressed).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(path = %layout.compressed, error = %e, "Existence check failed, treating as absent");
                false
            }
        };
        if exists {
            return Ok(false);
        }

        match self.compressor.variant(content.as_bytes(), content_type)? {
            Some(v) => {
                self.write_variant(container, &layout.compressed, &v, content_type)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Served path and CDN URL for content already published, without I/O.
    ///
    /// Cached responses use this to answer requests whose encoding differs
    /// from the one that triggered the publish.
    pub fn locate(
        &self,
        identity: &BundleIdentity,
        content: &str,
        content_type: ContentType,
        delivery: Delivery,
    ) -> Result<ServedLocation> {
        let layout = ArtifactLayout::for_bundle(&identity.virtual_path, content_type);
        let compressed = if delivery.accept_gzip && self.config.use_compression {
            self.compressor.variant(content.as_bytes(), content_type)?
        } else {
            None
        };
        let (path, bytes) = match compressed {
            Some(v) => (layout.compressed, v.bytes),
            None => (layout.plain, content.as_bytes().to_vec()),
        };
        let cdn_url = delivery.use_cdn.then(|| {
            versioned_url(
                self.config.cdn_base(identity.secure),
                &identity.container,
                &path,
                &bytes,
            )
        });
        Ok(ServedLocation { path, cdn_url })
    }

    fn finish(
        &self,
        identity: &BundleIdentity,
        mut outcome: PublishOutcome,
        served_bytes: &[u8],
        delivery: Delivery,
    ) -> PublishOutcome {
        if delivery.use_cdn {
            let url = versioned_url(
                self.config.cdn_base(identity.secure),
                &identity.container,
                &outcome.served_path,
                served_bytes,
            );
            debug!(url = %url, "Versioned CDN URL");
            outcome.cdn_url = Some(url);
        }
        if outcome.write_count() > 0 {
            info!(
                path = %outcome.layout.plain,
                plain_written = outcome.plain_written,
                compressed_written = ?outcome.compressed_written,
                "Published bundle artifact"
            );
        }
        outcome
    }

    fn properties(&self, content_type: ContentType) -> BlobProperties {
        BlobProperties::new(content_type.mime()).with_max_age(self.config.bundle_cache_ttl_secs)
    }

    async fn write_variant(
        &self,
        container: &str,
        path: &str,
        variant: &CompressedVariant,
        content_type: ContentType,
    ) -> Result<()> {
        let mut props = self.properties(content_type);
        if variant.gzip {
            props = props.gzip();
        } else if let Some(reason) = variant.skipped {
            debug!(path, ?reason, "Compression skipped, storing original bytes");
        }
        self.write(container, path, &variant.bytes, &props, "write compressed artifact")
            .await
    }

    async fn write(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        props: &BlobProperties,
        operation: &str,
    ) -> Result<()> {
        self.store
            .write_bytes(container, path, bytes, props)
            .await
            .map_err(|e| {
                warn!(container, path, error = %e, "Remote write failed");
                Error::publish(e, operation, container, path)
            })
    }

    async fn read_text_baseline(&self, container: &str, path: &str) -> Option<String> {
        match self.store.read_text(container, path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(container, path, error = %e, "Remote read failed, treating artifact as absent");
                None
            }
        }
    }

    async fn read_bytes_baseline(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        match self.store.read_bytes(container, path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(container, path, error = %e, "Remote read failed, treating artifact as absent");
                None
            }
        }
    }
}

const fn form_of(variant: &CompressedVariant) -> CompressedForm {
    if variant.gzip {
        CompressedForm::Gzip
    } else {
        CompressedForm::Original
    }
}

/// URL-safe SHA-256 fingerprint of served bytes
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes).as_slice())
}

/// `<cdn-base><container>/<path>?v=<hash>`
#[must_use]
pub fn versioned_url(cdn_base: &str, container: &str, path: &str, served_bytes: &[u8]) -> String {
    format!(
        "{cdn_base}{container}/{path}?v={}",
        content_hash(served_bytes)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BundleOverrides, BundleSettings, SettingsFile};
    use bundlecdn_blobstore::MemoryBlobStore;

    fn config(use_compression: bool) -> Arc<BundleConfig> {
        let settings = BundleSettings::from_file(SettingsFile {
            account_name: Some("acct".to_string()),
            access_key: Some("key".to_string()),
            cdn_path: Some("http://cdn.example.com/".to_string()),
            secure_cdn_path: Some("https://secure.example.com/".to_string()),
            bundle_cache_ttl_secs: Some(600),
            use_compression: Some(use_compression),
            ..Default::default()
        })
        .unwrap();
        Arc::new(BundleConfig::resolve("assets", BundleOverrides::default(), &settings).unwrap())
    }

    fn publisher(use_compression: bool) -> (Arc<MemoryBlobStore>, ArtifactPublisher) {
        let store = Arc::new(MemoryBlobStore::new());
        let publisher = ArtifactPublisher::new(store.clone(), config(use_compression));
        (store, publisher)
    }

    fn site() -> BundleIdentity {
        BundleIdentity::new("~/css/site", "assets", false)
    }

    #[tokio::test]
    async fn small_stylesheet_published_once() {
        let (store, publisher) = publisher(false);
        let content = "body{color:red}";

        let first = publisher
            .publish(&site(), content, ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        assert!(first.plain_written);
        assert_eq!(first.compressed_written, None);
        assert_eq!(store.write_count(), 1);

        let (bytes, props) = store.get("assets", "css/site.css").unwrap();
        assert_eq!(bytes, content.as_bytes());
        assert_eq!(props.content_type, "text/css");
        assert_eq!(props.cache_control.as_deref(), Some("public, max-age=600"));

        let second = publisher
            .publish(&site(), content, ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        assert_eq!(second.write_count(), 0);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn small_stylesheet_with_compression_stores_original_bytes() {
        let (store, publisher) = publisher(true);
        let content = "body{color:red}";

        let outcome = publisher
            .publish(&site(), content, ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        assert_eq!(outcome.compressed_written, Some(CompressedForm::Original));

        let (bytes, props) = store.get("assets", "css/compressed/site.css").unwrap();
        assert_eq!(bytes, content.as_bytes());
        assert!(!props.is_gzip());
    }

    #[tokio::test]
    async fn large_repetitive_stylesheet_writes_gzip_sibling() {
        let (store, publisher) = publisher(true);
        let content = "a{b:c}".repeat(400)[..2000].to_string();

        let outcome = publisher
            .publish(&site(), &content, ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        assert!(outcome.plain_written);
        assert_eq!(outcome.compressed_written, Some(CompressedForm::Gzip));

        let (bytes, props) = store.get("assets", "css/compressed/site.css").unwrap();
        assert!(bytes.len() < 50);
        assert!(props.is_gzip());
        assert_eq!(props.content_type, "text/css");
    }

    #[tokio::test]
    async fn changed_content_overwrites() {
        let (store, publisher) = publisher(false);
        publisher
            .publish(&site(), "a{}", ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        let outcome = publisher
            .publish(&site(), "b{}", ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        assert!(outcome.plain_written);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.get("assets", "css/site.css").unwrap().0, b"b{}");
    }

    #[tokio::test]
    async fn gzip_request_backfills_missing_sibling() {
        let (store, publisher) = publisher(true);
        let content = "x{y:z}".repeat(100);
        // Plain artifact already current; sibling missing
        store.seed(
            "assets",
            "css/site.css",
            content.clone(),
            BlobProperties::new("text/css"),
            chrono::Utc::now(),
        );

        let delivery = Delivery {
            accept_gzip: true,
            use_cdn: false,
        };
        let outcome = publisher
            .publish(&site(), &content, ContentType::Stylesheet, delivery)
            .await
            .unwrap();
        assert!(!outcome.plain_written);
        assert_eq!(outcome.compressed_written, Some(CompressedForm::Gzip));
        assert_eq!(outcome.served_path, "css/compressed/site.css");

        // A repeat gzip request finds the sibling current
        let again = publisher
            .publish(&site(), &content, ContentType::Stylesheet, delivery)
            .await
            .unwrap();
        assert_eq!(again.write_count(), 0);
    }

    #[tokio::test]
    async fn gzip_request_rewrites_stale_sibling() {
        let (store, publisher) = publisher(true);
        let content = "x{y:z}".repeat(100);
        store.seed(
            "assets",
            "css/site.css",
            content.clone(),
            BlobProperties::new("text/css"),
            chrono::Utc::now(),
        );
        store.seed(
            "assets",
            "css/compressed/site.css",
            "outdated",
            BlobProperties::new("text/css").gzip(),
            chrono::Utc::now(),
        );

        let outcome = publisher
            .publish(
                &site(),
                &content,
                ContentType::Stylesheet,
                Delivery {
                    accept_gzip: true,
                    use_cdn: false,
                },
            )
            .await
            .unwrap();
        assert!(!outcome.plain_written);
        assert_eq!(outcome.compressed_written, Some(CompressedForm::Gzip));
        assert_eq!(store.write_count(), 1);

        let expected = Compressor::default()
            .variant(content.as_bytes(), ContentType::Stylesheet)
            .unwrap()
            .unwrap();
        let (bytes, props) = store.get("assets", "css/compressed/site.css").unwrap();
        assert_eq!(bytes, expected.bytes);
        assert!(props.is_gzip());
    }

    #[tokio::test]
    async fn read_failure_is_treated_as_absent() {
        let (store, publisher) = publisher(false);
        store.seed(
            "assets",
            "css/site.css",
            "a{}",
            BlobProperties::new("text/css"),
            chrono::Utc::now(),
        );
        store.set_fail_reads(true);

        let outcome = publisher
            .publish(&site(), "a{}", ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap();
        assert!(outcome.plain_written);
    }

    #[tokio::test]
    async fn write_failure_propagates() {
        let (store, publisher) = publisher(false);
        store.set_fail_writes(true);
        let err = publisher
            .publish(&site(), "a{}", ContentType::Stylesheet, Delivery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
    }

    #[tokio::test]
    async fn cdn_url_is_versioned_by_served_bytes() {
        let (_store, publisher) = publisher(false);
        let delivery = Delivery {
            accept_gzip: false,
            use_cdn: true,
        };

        let plain = publisher
            .publish(&site(), "a{}", ContentType::Stylesheet, delivery)
            .await
            .unwrap();
        let url = plain.cdn_url.unwrap();
        assert!(url.starts_with("http://cdn.example.com/assets/css/site.css?v="));
        assert_eq!(url, versioned_url("http://cdn.example.com/", "assets", "css/site.css", b"a{}"));

        let secure_identity = BundleIdentity::new("~/css/site", "assets", true);
        let secure = publisher
            .publish(&secure_identity, "b{}", ContentType::Stylesheet, delivery)
            .await
            .unwrap();
        let secure_url = secure.cdn_url.unwrap();
        assert!(secure_url.starts_with("https://secure.example.com/assets/css/site.css?v="));
        assert_ne!(url.split("?v=").nth(1), secure_url.split("?v=").nth(1));
    }

    #[test]
    fn content_hash_is_url_safe() {
        let hash = content_hash(&[0xfb, 0xff, 0xfe, 0x00, 0x10]);
        assert!(!hash.contains(['+', '/', '=']));
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
    }

    #[test]
    fn accept_encoding_detection() {
        assert!(Delivery::from_accept_encoding(Some("gzip, deflate, br"), false).accept_gzip);
        assert!(Delivery::from_accept_encoding(Some("GZIP"), false).accept_gzip);
        assert!(!Delivery::from_accept_encoding(Some("br"), false).accept_gzip);
        assert!(!Delivery::from_accept_encoding(None, true).accept_gzip);
    }

    #[tokio::test]
    async fn ensure_compressed_writes_only_when_missing() {
        let (store, publisher) = publisher(true);
        let content = "p{m:0}".repeat(100);
        assert!(
            publisher
                .ensure_compressed(&site(), &content, ContentType::Stylesheet)
                .await
                .unwrap()
        );
        assert!(
            !publisher
                .ensure_compressed(&site(), &content, ContentType::Stylesheet)
                .await
                .unwrap()
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn locate_matches_publish_outcome() {
        let (_store, publisher) = publisher(true);
        let content = "q{r:s}".repeat(100);
        let delivery = Delivery {
            accept_gzip: true,
            use_cdn: true,
        };
        let location = publisher
            .locate(&site(), &content, ContentType::Stylesheet, delivery)
            .unwrap();
        assert_eq!(location.path, "css/compressed/site.css");

        let outcome = publisher
            .publish(&site(), &content, ContentType::Stylesheet, delivery)
            .await
            .unwrap();
        assert_eq!(outcome.location(), location);
    }
}
