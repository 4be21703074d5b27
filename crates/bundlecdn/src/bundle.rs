//! Bundle request handling
//!
//! [`BundleService`] ties the pieces together: a cache hit is served from
//! memory, a miss generates the bundle, publishes changed artifacts, arms a
//! [`DependencyWatcher`] over the bundle's sources and caches the response.

use crate::config::BundleConfig;
use crate::identity::{BundleIdentity, ContentType, source_blob_path};
use crate::publish::{ArtifactPublisher, Delivery};
use crate::response_cache::{CachedBundle, ResponseCache};
use crate::watcher::DependencyWatcher;
use crate::{Error, Result};
use async_trait::async_trait;
use bundlecdn_blobstore::BlobStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Output of bundle generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedBundle {
    /// Concatenated (and possibly transformed) content
    pub content: String,
    /// Stylesheet or script
    pub content_type: ContentType,
    /// Virtual paths of every source file the content was built from
    pub sources: Vec<String>,
}

/// Produces bundle content on a cache miss
#[async_trait]
pub trait BundleGenerator: Send + Sync {
    /// Generate the bundle registered at `virtual_path`
    async fn generate(&self, virtual_path: &str) -> Result<GeneratedBundle>;
}

/// Source files making up one bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDefinition {
    /// Stylesheet or script
    pub content_type: ContentType,
    /// Source virtual paths, concatenated in order
    pub sources: Vec<String>,
}

/// Generator that concatenates source files read from the blob store
pub struct ConcatGenerator {
    store: Arc<dyn BlobStore>,
    container: String,
    bundles: BTreeMap<String, BundleDefinition>,
}

impl std::fmt::Debug for ConcatGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcatGenerator")
            .field("container", &self.container)
            .field("bundles", &self.bundles.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ConcatGenerator {
    /// Generator with no bundles registered
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, container: impl Into<String>) -> Self {
        Self {
            store,
            container: container.into(),
            bundles: BTreeMap::new(),
        }
    }

    /// Register a bundle under its virtual path
    #[must_use]
    pub fn with_bundle(mut self, virtual_path: impl Into<String>, definition: BundleDefinition) -> Self {
        self.bundles.insert(virtual_path.into(), definition);
        self
    }
}

#[async_trait]
impl BundleGenerator for ConcatGenerator {
    async fn generate(&self, virtual_path: &str) -> Result<GeneratedBundle> {
        let definition = self
            .bundles
            .get(virtual_path)
            .ok_or_else(|| Error::generation(virtual_path, "no bundle registered at this path"))?;

        let mut parts = Vec::with_capacity(definition.sources.len());
        for source in &definition.sources {
            let path = source_blob_path(source);
            let text = self
                .store
                .read_text(&self.container, &path)
                .await
                .map_err(|e| Error::generation(virtual_path, format!("reading {path}: {e}")))?
                .ok_or_else(|| Error::generation(virtual_path, format!("source {path} not found")))?;
            parts.push(text);
        }

        Ok(GeneratedBundle {
            content: parts.join("\n"),
            content_type: definition.content_type,
            sources: definition.sources.clone(),
        })
    }
}

/// One incoming bundle request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    /// Bundle virtual path, e.g. `~/css/site`
    pub virtual_path: String,
    /// Request arrived over an encrypted connection
    pub secure: bool,
    /// Raw `Accept-Encoding` header value
    pub accept_encoding: Option<String>,
}

impl BundleRequest {
    /// Plain request without `Accept-Encoding`
    #[must_use]
    pub fn new(virtual_path: impl Into<String>) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            secure: false,
            accept_encoding: None,
        }
    }

    /// Mark the request as encrypted
    #[must_use]
    pub const fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the `Accept-Encoding` header value
    #[must_use]
    pub fn accept_encoding(mut self, value: impl Into<String>) -> Self {
        self.accept_encoding = Some(value.into());
        self
    }
}

/// Response to a bundle request
#[derive(Debug, Clone)]
pub struct BundleResponse {
    /// The generated or cached bundle
    pub bundle: Arc<CachedBundle>,
    /// Served from the response cache
    pub cache_hit: bool,
    /// Remote path the client is directed to
    pub served_path: String,
    /// Versioned CDN URL, when CDN delivery is enabled
    pub cdn_url: Option<String>,
}

/// Serves bundles for one container
pub struct BundleService {
    store: Arc<dyn BlobStore>,
    config: Arc<BundleConfig>,
    publisher: ArtifactPublisher,
    generator: Arc<dyn BundleGenerator>,
    cache: ResponseCache,
    use_cdn: bool,
}

impl std::fmt::Debug for BundleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleService")
            .field("container", &self.config.container)
            .field("cache", &self.cache)
            .field("use_cdn", &self.use_cdn)
            .finish_non_exhaustive()
    }
}

impl BundleService {
    /// Service with a default response cache and CDN delivery enabled
    #[must_use]
    pub fn new(
        store: Arc<dyn BlobStore>,
        config: BundleConfig,
        generator: Arc<dyn BundleGenerator>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            publisher: ArtifactPublisher::new(Arc::clone(&store), Arc::clone(&config)),
            store,
            config,
            generator,
            cache: ResponseCache::default(),
            use_cdn: true,
        }
    }

    /// Replace the response cache, e.g. to use another namespace
    #[must_use]
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = cache;
        self
    }

    /// Serve artifacts from the store directly instead of through the CDN
    #[must_use]
    pub const fn with_cdn(mut self, use_cdn: bool) -> Self {
        self.use_cdn = use_cdn;
        self
    }

    /// The response cache
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Resolved bundle configuration
    #[must_use]
    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// Handle a bundle request
    #[instrument(
        name = "bundle_request",
        skip(self, request),
        fields(virtual_path = %request.virtual_path, secure = request.secure)
    )]
    pub async fn handle(&self, request: &BundleRequest) -> Result<BundleResponse> {
        let identity = BundleIdentity::new(
            &request.virtual_path,
            &self.config.container,
            request.secure,
        );
        let key = self.cache.key_for(&identity);
        let delivery = Delivery::from_accept_encoding(request.accept_encoding.as_deref(), self.use_cdn);

        if let Some(bundle) = self.cache.get(&key) {
            debug!(key = %key, "Bundle cache hit");
            if delivery.accept_gzip {
                self.publisher
                    .ensure_compressed(&identity, &bundle.content, bundle.content_type)
                    .await?;
            }
            let location = match bundle.location(delivery.accept_gzip) {
                Some(location) => location.clone(),
                None => {
                    let location = self.publisher.locate(
                        &identity,
                        &bundle.content,
                        bundle.content_type,
                        delivery,
                    )?;
                    bundle
                        .remember_location(delivery.accept_gzip, location)
                        .clone()
                }
            };
            return Ok(BundleResponse {
                bundle,
                cache_hit: true,
                served_path: location.path,
                cdn_url: location.cdn_url,
            });
        }

        debug!(key = %key, "Bundle cache miss");
        let generated_at = Utc::now();
        let generated = self.generator.generate(&request.virtual_path).await?;
        let outcome = self
            .publisher
            .publish(&identity, &generated.content, generated.content_type, delivery)
            .await?;

        let watcher = DependencyWatcher::start(
            Arc::clone(&self.store),
            self.config.container.clone(),
            generated.sources.iter().map(|s| source_blob_path(s)),
            generated_at,
            &self.config.watcher_config(),
        )
        .await;

        let served_path = outcome.served_path.clone();
        let cdn_url = outcome.cdn_url.clone();
        let bundle = Arc::new(CachedBundle::new(
            generated.content,
            generated.content_type,
            outcome,
            generated_at,
            delivery.accept_gzip,
        ));
        self.cache
            .insert(key, Arc::clone(&bundle), Some(Arc::new(watcher)));

        Ok(BundleResponse {
            bundle,
            cache_hit: false,
            served_path,
            cdn_url,
        })
    }
}
