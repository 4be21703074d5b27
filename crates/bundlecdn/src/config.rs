//! Configuration for bundle publishing
//!
//! Settings are built once at startup and passed to every component:
//! - [`BundleSettings`]: process-wide defaults loaded from an optional JSON
//!   file and `BUNDLECDN_*` environment overrides
//! - [`BundleConfig`]: one bundle's resolved configuration, where per-bundle
//!   [`BundleOverrides`] win over the global settings

use crate::watcher::WatcherConfig;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Default interval between dependency poll ticks
pub const DEFAULT_CACHE_POLL_SECS: u64 = 60;

/// Default `max-age` for published artifacts
pub const DEFAULT_BUNDLE_CACHE_TTL_SECS: u64 = 3600;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "BUNDLECDN_";

/// Settings file contents; every field is optional
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsFile {
    /// Storage account name
    #[serde(default)]
    pub account_name: Option<String>,
    /// Storage access key
    #[serde(default)]
    pub access_key: Option<String>,
    /// Base URL used for plain requests, e.g. `http://cdn.example.com/`
    #[serde(default)]
    pub cdn_path: Option<String>,
    /// Base URL used for encrypted requests
    #[serde(default)]
    pub secure_cdn_path: Option<String>,
    /// Seconds between dependency poll ticks
    #[serde(default)]
    pub cache_poll_secs: Option<u64>,
    /// `max-age` seconds set on published artifacts
    #[serde(default)]
    pub bundle_cache_ttl_secs: Option<u64>,
    /// Whether gzip variants are published and served
    #[serde(default)]
    pub use_compression: Option<bool>,
    /// Consecutive failing poll ticks before a forced invalidation
    #[serde(default)]
    pub failure_escalation_threshold: Option<u32>,
}

impl SettingsFile {
    /// Parse settings from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::serialization(format!("Failed to parse settings: {e}")))
    }

    /// Read settings from a JSON file
    pub fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_json(&json)
    }

    /// Apply `BUNDLECDN_*` overrides from the given lookup.
    ///
    /// Values that fail to parse leave the previous value in place.
    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = var("ACCOUNT_NAME") {
            self.account_name = Some(v);
        }
        if let Some(v) = var("ACCESS_KEY") {
            self.access_key = Some(v);
        }
        if let Some(v) = var("CDN_PATH") {
            self.cdn_path = Some(v);
        }
        if let Some(v) = var("SECURE_CDN_PATH") {
            self.secure_cdn_path = Some(v);
        }
        parse_into(&var, "CACHE_POLL_SECS", &mut self.cache_poll_secs, parse_number);
        parse_into(
            &var,
            "BUNDLE_CACHE_TTL_SECS",
            &mut self.bundle_cache_ttl_secs,
            parse_number,
        );
        parse_into(&var, "USE_COMPRESSION", &mut self.use_compression, parse_flag);
        parse_into(
            &var,
            "FAILURE_ESCALATION_THRESHOLD",
            &mut self.failure_escalation_threshold,
            parse_number,
        );
        self
    }
}

fn parse_into<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut Option<T>,
    parse: fn(&str) -> Option<T>,
) {
    if let Some(raw) = var(name) {
        match parse(raw.trim()) {
            Some(value) => *slot = Some(value),
            None => warn!(
                variable = %format!("{ENV_PREFIX}{name}"),
                value = %raw,
                "Ignoring unparseable setting override"
            ),
        }
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

/// `true`/`false` in any letter case
fn parse_flag(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Process-wide bundle settings
#[derive(Debug, Clone)]
pub struct BundleSettings {
    /// Storage account name
    pub account_name: String,
    /// Storage access key
    pub access_key: SecretString,
    /// Base URL for plain requests
    pub cdn_path: String,
    /// Base URL for encrypted requests
    pub secure_cdn_path: String,
    /// Interval between dependency poll ticks
    pub cache_poll_interval: Duration,
    /// `max-age` seconds on published artifacts
    pub bundle_cache_ttl_secs: u64,
    /// Whether gzip variants are published and served
    pub use_compression: bool,
    /// Consecutive failing poll ticks before a forced invalidation
    pub failure_escalation_threshold: Option<u32>,
}

impl BundleSettings {
    /// Load settings from an optional file plus the process environment.
    ///
    /// Fails when the account name or access key ends up empty.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading bundle settings file");
                SettingsFile::read(path)?
            }
            None => SettingsFile::default(),
        };
        Self::from_file(file.with_env_overrides(|name| std::env::var(name).ok()))
    }

    /// Build settings from parsed file contents, applying defaults
    pub fn from_file(file: SettingsFile) -> Result<Self> {
        let account_name = file.account_name.unwrap_or_default();
        let access_key = file.access_key.unwrap_or_default();
        if account_name.trim().is_empty() || access_key.trim().is_empty() {
            return Err(Error::configuration(
                "account name and access key are required",
            ));
        }

        Ok(Self {
            account_name,
            access_key: SecretString::from(access_key),
            cdn_path: file.cdn_path.unwrap_or_default(),
            secure_cdn_path: file.secure_cdn_path.unwrap_or_default(),
            cache_poll_interval: Duration::from_secs(
                file.cache_poll_secs
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_CACHE_POLL_SECS),
            ),
            bundle_cache_ttl_secs: file
                .bundle_cache_ttl_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_BUNDLE_CACHE_TTL_SECS),
            use_compression: file.use_compression.unwrap_or(false),
            failure_escalation_threshold: file.failure_escalation_threshold.filter(|n| *n > 0),
        })
    }
}

/// Per-bundle settings; unset fields fall back to [`BundleSettings`]
#[derive(Debug, Clone, Default)]
pub struct BundleOverrides {
    /// Storage account name
    pub account_name: Option<String>,
    /// Storage access key
    pub access_key: Option<SecretString>,
    /// Base URL for plain requests
    pub cdn_path: Option<String>,
    /// Base URL for encrypted requests
    pub secure_cdn_path: Option<String>,
    /// Interval between dependency poll ticks
    pub cache_poll_interval: Option<Duration>,
    /// `max-age` seconds on published artifacts
    pub bundle_cache_ttl_secs: Option<u64>,
    /// Whether gzip variants are published and served
    pub use_compression: Option<bool>,
}

/// One bundle's fully resolved configuration
#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// Container the sources are read from and artifacts published to
    pub container: String,
    /// Storage account name
    pub account_name: String,
    /// Storage access key
    pub access_key: SecretString,
    /// Base URL for plain requests
    pub cdn_path: String,
    /// Base URL for encrypted requests
    pub secure_cdn_path: String,
    /// Interval between dependency poll ticks
    pub cache_poll_interval: Duration,
    /// `max-age` seconds on published artifacts
    pub bundle_cache_ttl_secs: u64,
    /// Whether gzip variants are published and served
    pub use_compression: bool,
    /// Consecutive failing poll ticks before a forced invalidation
    pub failure_escalation_threshold: Option<u32>,
}

impl BundleConfig {
    /// Resolve a bundle's configuration against the global settings
    pub fn resolve(
        container: impl Into<String>,
        overrides: BundleOverrides,
        global: &BundleSettings,
    ) -> Result<Self> {
        let container = container.into();
        if container.trim().is_empty() {
            return Err(Error::configuration("bundle container is required"));
        }

        let non_empty = |value: Option<String>, fallback: &str| {
            value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };

        let access_key = overrides
            .access_key
            .filter(|k| !k.expose_secret().trim().is_empty())
            .unwrap_or_else(|| global.access_key.clone());

        Ok(Self {
            account_name: non_empty(overrides.account_name, &global.account_name),
            access_key,
            cdn_path: non_empty(overrides.cdn_path, &global.cdn_path),
            secure_cdn_path: non_empty(overrides.secure_cdn_path, &global.secure_cdn_path),
            cache_poll_interval: overrides
                .cache_poll_interval
                .filter(|d| !d.is_zero())
                .unwrap_or(global.cache_poll_interval),
            bundle_cache_ttl_secs: overrides
                .bundle_cache_ttl_secs
                .filter(|s| *s > 0)
                .unwrap_or(global.bundle_cache_ttl_secs),
            use_compression: overrides.use_compression.unwrap_or(global.use_compression),
            failure_escalation_threshold: global.failure_escalation_threshold,
            container,
        })
    }

    /// CDN base URL for a request's security context
    #[must_use]
    pub fn cdn_base(&self, secure: bool) -> &str {
        if secure {
            &self.secure_cdn_path
        } else {
            &self.cdn_path
        }
    }

    /// Watcher settings derived from this bundle's configuration
    #[must_use]
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: self.cache_poll_interval,
            failure_escalation_threshold: self.failure_escalation_threshold,
        }
    }
}
