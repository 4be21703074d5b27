//! In-process cache of generated bundle responses
//!
//! Entries carry an optional invalidation source. When that source reports a
//! change the entry is evicted, but only if it is still the entry the source
//! was registered for; a replaced entry is never evicted by a stale watcher.

use crate::identity::{BundleIdentity, ContentType, DEFAULT_CACHE_NAMESPACE};
use crate::publish::{PublishOutcome, ServedLocation};
use crate::watcher::Invalidatable;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A generated bundle kept for subsequent requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBundle {
    /// Generated content
    pub content: String,
    /// Content type of the bundle
    pub content_type: ContentType,
    /// What publishing did when the bundle was generated
    pub outcome: PublishOutcome,
    /// Generation start time; the watcher's initial marker
    pub generated_at: DateTime<Utc>,
    plain_location: OnceLock<ServedLocation>,
    gzip_location: OnceLock<ServedLocation>,
}

impl CachedBundle {
    /// Cache entry for a bundle published for a request with `accept_gzip`
    #[must_use]
    pub fn new(
        content: String,
        content_type: ContentType,
        outcome: PublishOutcome,
        generated_at: DateTime<Utc>,
        accept_gzip: bool,
    ) -> Self {
        let bundle = Self {
            content,
            content_type,
            outcome,
            generated_at,
            plain_location: OnceLock::new(),
            gzip_location: OnceLock::new(),
        };
        bundle.remember_location(accept_gzip, bundle.outcome.location());
        bundle
    }

    /// Known served location for one encoding
    #[must_use]
    pub fn location(&self, accept_gzip: bool) -> Option<&ServedLocation> {
        self.location_cell(accept_gzip).get()
    }

    /// Record the served location for one encoding; the first record wins
    pub fn remember_location(&self, accept_gzip: bool, location: ServedLocation) -> &ServedLocation {
        self.location_cell(accept_gzip).get_or_init(|| location)
    }

    const fn location_cell(&self, accept_gzip: bool) -> &OnceLock<ServedLocation> {
        if accept_gzip {
            &self.gzip_location
        } else {
            &self.plain_location
        }
    }
}

struct Entry {
    bundle: Arc<CachedBundle>,
    source: Option<Arc<dyn Invalidatable>>,
    generation: u64,
}

/// Keyed response cache with watcher-driven eviction
pub struct ResponseCache {
    namespace: String,
    entries: Arc<DashMap<String, Entry>>,
    next_generation: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("namespace", &self.namespace)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_NAMESPACE)
    }
}

impl ResponseCache {
    /// Empty cache with keys in `namespace`
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Key namespace
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cache key for a bundle identity in this cache's namespace
    #[must_use]
    pub fn key_for(&self, identity: &BundleIdentity) -> String {
        identity.cache_key(&self.namespace)
    }

    /// Insert or replace an entry.
    ///
    /// A replaced entry's source is disposed. The new source's change
    /// notification evicts this entry.
    pub fn insert(
        &self,
        key: impl Into<String>,
        bundle: Arc<CachedBundle>,
        source: Option<Arc<dyn Invalidatable>>,
    ) {
        let key = key.into();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                bundle,
                source: source.clone(),
                generation,
            },
        );
        if let Some(previous) = previous
            && let Some(old) = previous.source
        {
            old.dispose();
        }

        if let Some(source) = source {
            let entries = Arc::downgrade(&self.entries);
            let evictions = Arc::clone(&self.evictions);
            source.on_source_changed(Box::new(move |notification| {
                let Some(entries) = entries.upgrade() else {
                    return;
                };
                if let Some((key, entry)) =
                    entries.remove_if(&key, |_, entry| entry.generation == generation)
                {
                    evictions.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        key = %key,
                        last_modified = %notification.last_modified,
                        "Evicted stale bundle"
                    );
                    if let Some(source) = entry.source {
                        source.dispose();
                    }
                }
            }));
        }
    }

    /// Cached bundle for a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CachedBundle>> {
        self.entries
            .get(key)
            .map(|entry| Arc::clone(&entry.bundle))
    }

    /// Whether a key is cached
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry and dispose its source; returns whether it existed
    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                if let Some(source) = entry.source {
                    source.dispose();
                }
                true
            }
            None => false,
        }
    }

    /// Drop every entry and dispose every source
    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries evicted by change notifications so far
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::SeqCst)
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ArtifactLayout;
    use crate::watcher::{ChangeCallback, ChangeNotification};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct ManualSource {
        callbacks: Mutex<Vec<ChangeCallback>>,
        fired: AtomicBool,
        disposed: AtomicBool,
    }

    impl ManualSource {
        fn fire(&self) {
            self.fired.store(true, Ordering::SeqCst);
            let callbacks = std::mem::take(&mut *self.callbacks.lock());
            for callback in callbacks {
                callback(ChangeNotification {
                    last_modified: Utc::now(),
                });
            }
        }

        fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }
    }

    impl Invalidatable for ManualSource {
        fn on_source_changed(&self, callback: ChangeCallback) {
            self.callbacks.lock().push(callback);
        }

        fn is_stale(&self) -> bool {
            self.fired.load(Ordering::SeqCst)
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    fn bundle(content: &str) -> Arc<CachedBundle> {
        let layout = ArtifactLayout::for_bundle("~/js/app", ContentType::Script);
        Arc::new(CachedBundle::new(
            content.to_string(),
            ContentType::Script,
            PublishOutcome {
                served_path: layout.plain.clone(),
                layout,
                plain_written: true,
                compressed_written: None,
                cdn_url: None,
            },
            Utc::now(),
            false,
        ))
    }

    #[test]
    fn locations_are_remembered_per_encoding() {
        let bundle = bundle("v");
        assert_eq!(bundle.location(false).unwrap().path, "js/app.js");
        assert!(bundle.location(true).is_none());

        let gzip = ServedLocation {
            path: "js/compressed/app.js".to_string(),
            cdn_url: None,
        };
        bundle.remember_location(true, gzip.clone());
        let other = ServedLocation {
            path: "elsewhere.js".to_string(),
            cdn_url: None,
        };
        assert_eq!(bundle.remember_location(true, other), &gzip);
        assert_eq!(bundle.location(true), Some(&gzip));
    }

    #[test]
    fn change_notification_evicts_entry() {
        let cache = ResponseCache::default();
        let source = Arc::new(ManualSource::default());
        cache.insert("k", bundle("v1"), Some(source.clone()));
        assert_eq!(cache.get("k").unwrap().content, "v1");

        source.fire();
        assert!(cache.get("k").is_none());
        assert_eq!(cache.evictions(), 1);
        assert!(source.is_disposed());
    }

    #[test]
    fn stale_source_does_not_evict_replacement() {
        let cache = ResponseCache::default();
        let first = Arc::new(ManualSource::default());
        let second = Arc::new(ManualSource::default());
        cache.insert("k", bundle("v1"), Some(first.clone()));
        cache.insert("k", bundle("v2"), Some(second.clone()));
        assert!(first.is_disposed());

        first.fire();
        assert_eq!(cache.get("k").unwrap().content, "v2");
        assert_eq!(cache.evictions(), 0);

        second.fire();
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_and_clear_dispose_sources() {
        let cache = ResponseCache::new("ns");
        let a = Arc::new(ManualSource::default());
        let b = Arc::new(ManualSource::default());
        cache.insert("a", bundle("a"), Some(a.clone()));
        cache.insert("b", bundle("b"), Some(b.clone()));
        cache.insert("c", bundle("c"), None);
        assert_eq!(cache.len(), 3);

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(a.is_disposed());

        cache.clear();
        assert!(cache.is_empty());
        assert!(b.is_disposed());
    }

    #[test]
    fn notification_after_cache_dropped_is_ignored() {
        let source = Arc::new(ManualSource::default());
        {
            let cache = ResponseCache::default();
            cache.insert("k", bundle("v"), Some(source.clone()));
        }
        source.fire();
    }

    #[test]
    fn keys_are_namespaced() {
        let cache = ResponseCache::new("site");
        let identity = BundleIdentity::new("~/js/app", "assets", true);
        assert_eq!(cache.key_for(&identity), "site:~/js/appssl");
        assert_eq!(cache.namespace(), "site");
    }
}
