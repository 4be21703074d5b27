//! Content-addressed bundle publishing with polling-based invalidation.
//!
//! Generated CSS/JS bundles are published to a remote blob store under
//! deterministic paths, only when their content changed, optionally with a
//! gzip sibling. Clients are directed to versioned CDN URLs that change
//! whenever the served bytes change. Because the store cannot push change
//! notifications, cached responses are invalidated by watchers that poll
//! source file timestamps.
//!
//! # Architecture
//!
//! ```text
//!  BundleRequest
//!       │
//!       ▼
//! ┌───────────────┐ hit  ┌───────────────┐
//! │ BundleService │─────▶│ ResponseCache │◀──── evict ────┐
//! └───────────────┘      └───────────────┘                │
//!       │ miss                                            │
//!       ▼                                                 │
//! ┌─────────────────┐   ┌───────────────────┐   ┌───────────────────┐
//! │ BundleGenerator │──▶│ ArtifactPublisher │   │ DependencyWatcher │
//! └─────────────────┘   │  + Compressor     │   │  (poll timestamps)│
//!                       └───────────────────┘   └───────────────────┘
//!                                 │                       │
//!                                 ▼                       ▼
//!                        ┌──────────────────────────────────────┐
//!                        │          dyn BlobStore               │
//!                        └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use bundlecdn::{BundleConfig, BundleOverrides, BundleRequest, BundleService, BundleSettings};
//!
//! let settings = BundleSettings::load(None)?;
//! let config = BundleConfig::resolve("assets", BundleOverrides::default(), &settings)?;
//! let service = BundleService::new(store, config, generator);
//!
//! let response = service
//!     .handle(&BundleRequest::new("~/css/site").accept_encoding("gzip"))
//!     .await?;
//! println!("{}", response.cdn_url.unwrap_or(response.served_path));
//! ```

// TODO(bundlecdn-docs): Add # Errors documentation to all fallible public functions
#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod bundle;
pub mod compress;
pub mod config;
mod error;
pub mod identity;
pub mod publish;
pub mod response_cache;
pub mod watcher;

pub use bundle::{
    BundleDefinition, BundleGenerator, BundleRequest, BundleResponse, BundleService,
    ConcatGenerator, GeneratedBundle,
};
pub use compress::{CompressedVariant, Compression, Compressor, SkipReason};
pub use config::{BundleConfig, BundleOverrides, BundleSettings, SettingsFile};
pub use error::{Error, Result};
pub use identity::{ArtifactLayout, BundleIdentity, ContentType, DEFAULT_CACHE_NAMESPACE};
pub use publish::{
    ArtifactPublisher, CompressedForm, Delivery, PublishOutcome, ServedLocation, versioned_url,
};
pub use response_cache::{CachedBundle, ResponseCache};
pub use watcher::{
    ChangeCallback, ChangeNotification, DependencyRecord, DependencyWatcher, Invalidatable,
    TickOutcome, WatcherConfig, WatcherState,
};
