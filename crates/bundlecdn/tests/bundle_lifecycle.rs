//! End-to-end bundle lifecycle: publish, serve from cache, invalidate on
//! source change and republish.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bundlecdn::{
    BundleConfig, BundleDefinition, BundleOverrides, BundleRequest, BundleService,
    BundleSettings, ConcatGenerator, ContentType, SettingsFile, versioned_url,
};
use bundlecdn_blobstore::{BlobProperties, BlobStore, FsBlobStore, MemoryBlobStore};
use chrono::Utc;
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

fn settings(use_compression: bool) -> BundleSettings {
    BundleSettings::from_file(SettingsFile {
        account_name: Some("acct".to_string()),
        access_key: Some("secret".to_string()),
        cdn_path: Some("http://cdn.example.com/".to_string()),
        secure_cdn_path: Some("https://cdn.example.com/".to_string()),
        use_compression: Some(use_compression),
        ..Default::default()
    })
    .unwrap()
}

fn fast_polling() -> BundleOverrides {
    BundleOverrides {
        cache_poll_interval: Some(Duration::from_millis(10)),
        ..Default::default()
    }
}

fn script_bundle(store: Arc<dyn BlobStore>) -> Arc<ConcatGenerator> {
    Arc::new(ConcatGenerator::new(store, "assets").with_bundle(
        "~/js/app",
        BundleDefinition {
            content_type: ContentType::Script,
            sources: vec!["~/js/lib.js".to_string(), "~/js/main.js".to_string()],
        },
    ))
}

fn seed_sources(store: &MemoryBlobStore) {
    let props = BlobProperties::new("text/javascript");
    store.seed("assets", "js/lib.js", "var lib = 1;", props.clone(), Utc::now());
    store.seed("assets", "js/main.js", "lib();", props, Utc::now());
}

#[tokio::test]
async fn source_change_evicts_and_republishes() {
    let store = Arc::new(MemoryBlobStore::new());
    seed_sources(&store);
    let config = BundleConfig::resolve("assets", fast_polling(), &settings(false)).unwrap();
    let service = BundleService::new(store.clone(), config, script_bundle(store.clone()));
    let request = BundleRequest::new("~/js/app");

    let first = service.handle(&request).await.unwrap();
    assert!(!first.cache_hit);
    assert_eq!(first.served_path, "js/app.js");
    assert_eq!(
        store.get("assets", "js/app.js").unwrap().0,
        b"var lib = 1;\nlib();"
    );
    assert!(service.handle(&request).await.unwrap().cache_hit);

    store
        .write_text(
            "assets",
            "js/lib.js",
            "var lib = 2;",
            &BlobProperties::new("text/javascript"),
        )
        .await
        .unwrap();

    let key = service.cache().key_for(&bundlecdn::BundleIdentity::new(
        "~/js/app", "assets", false,
    ));
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.cache().contains(&key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stale bundle should be evicted");
    assert_eq!(service.cache().evictions(), 1);

    let regenerated = service.handle(&request).await.unwrap();
    assert!(!regenerated.cache_hit);
    assert_eq!(
        store.get("assets", "js/app.js").unwrap().0,
        b"var lib = 2;\nlib();"
    );
    assert_ne!(regenerated.cdn_url, first.cdn_url);
}

#[tokio::test]
async fn secure_and_plain_requests_are_cached_separately() {
    let store = Arc::new(MemoryBlobStore::new());
    seed_sources(&store);
    let config = BundleConfig::resolve("assets", BundleOverrides::default(), &settings(false)).unwrap();
    let service = BundleService::new(store.clone(), config, script_bundle(store.clone()));

    let plain = service.handle(&BundleRequest::new("~/js/app")).await.unwrap();
    let secure = service
        .handle(&BundleRequest::new("~/js/app").secure(true))
        .await
        .unwrap();

    assert!(!secure.cache_hit);
    assert_eq!(service.cache().len(), 2);
    assert!(plain.cdn_url.unwrap().starts_with("http://"));
    assert!(secure.cdn_url.unwrap().starts_with("https://"));
    // Same content, one upload
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn gzip_clients_get_compressed_sibling() {
    let store = Arc::new(MemoryBlobStore::new());
    let props = BlobProperties::new("text/javascript");
    let body = "function f(){return 1;}\n".repeat(60);
    store.seed("assets", "js/lib.js", body.clone(), props.clone(), Utc::now());
    store.seed("assets", "js/main.js", body, props, Utc::now());

    let config = BundleConfig::resolve("assets", BundleOverrides::default(), &settings(true)).unwrap();
    let service = BundleService::new(store.clone(), config, script_bundle(store.clone()));

    let plain = service.handle(&BundleRequest::new("~/js/app")).await.unwrap();
    assert_eq!(plain.served_path, "js/app.js");

    // Cache hit, different encoding
    let gzip = service
        .handle(&BundleRequest::new("~/js/app").accept_encoding("gzip, deflate"))
        .await
        .unwrap();
    assert!(gzip.cache_hit);
    assert_eq!(gzip.served_path, "js/compressed/app.js");

    let (bytes, props) = store.get("assets", "js/compressed/app.js").unwrap();
    assert!(props.is_gzip());
    let mut decoded = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, gzip.bundle.content);
    assert_eq!(
        gzip.cdn_url.as_deref(),
        Some(versioned_url("http://cdn.example.com/", "assets", "js/compressed/app.js", &bytes).as_str())
    );

    // Later gzip hits reuse the remembered location
    let remembered = gzip.bundle.location(true).cloned().unwrap();
    assert_eq!(remembered.path, "js/compressed/app.js");
    let again = service
        .handle(&BundleRequest::new("~/js/app").accept_encoding("gzip"))
        .await
        .unwrap();
    assert_eq!(again.cdn_url, remembered.cdn_url);
    assert_eq!(again.cdn_url, gzip.cdn_url);
}

#[tokio::test]
async fn failed_publish_fails_request_and_caches_nothing() {
    let store = Arc::new(MemoryBlobStore::new());
    seed_sources(&store);
    store.set_fail_writes(true);
    let config = BundleConfig::resolve("assets", BundleOverrides::default(), &settings(false)).unwrap();
    let service = BundleService::new(store.clone(), config, script_bundle(store.clone()));

    let err = service.handle(&BundleRequest::new("~/js/app")).await.unwrap_err();
    assert!(matches!(err, bundlecdn::Error::Publish { .. }));
    assert!(service.cache().is_empty());
}

#[tokio::test]
async fn filesystem_store_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(dir.path()).unwrap());
    let props = BlobProperties::new("text/css");
    store.write_text("assets", "css/a.css", "a{}", &props).await.unwrap();
    store.write_text("assets", "css/b.css", "b{}", &props).await.unwrap();

    let generator = Arc::new(ConcatGenerator::new(store.clone(), "assets").with_bundle(
        "~/css/site",
        BundleDefinition {
            content_type: ContentType::Stylesheet,
            sources: vec!["~/css/a.css".to_string(), "~/css/b.css".to_string()],
        },
    ));
    let config = BundleConfig::resolve("assets", BundleOverrides::default(), &settings(false)).unwrap();
    let service = BundleService::new(store.clone(), config, generator).with_cdn(false);

    let response = service.handle(&BundleRequest::new("~/css/site")).await.unwrap();
    assert_eq!(response.cdn_url, None);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("assets/css/site.css")).unwrap(),
        "a{}\nb{}"
    );
    let stored = store.properties("assets", "css/site.css").await.unwrap().unwrap();
    assert_eq!(stored.content_type, "text/css");
    assert_eq!(stored.cache_control.as_deref(), Some("public, max-age=3600"));
}
