//! Bundle identity, remote artifact layout and response cache keys

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace prefixed to every response cache key
pub const DEFAULT_CACHE_NAMESPACE: &str = "bundlecdn.bundle";

/// Directory segment holding compressed siblings
pub const COMPRESSED_DIR: &str = "compressed";

/// Content type of a generated artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// `text/css`
    Stylesheet,
    /// `text/javascript`
    Script,
    /// Anything else; never compressed
    Generic,
}

impl ContentType {
    /// MIME type stored with the blob
    #[must_use]
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Stylesheet => "text/css",
            Self::Script => "text/javascript",
            Self::Generic => "application/octet-stream",
        }
    }

    /// File extension appended to remote artifact names, empty for generic content
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Stylesheet => ".css",
            Self::Script => ".js",
            Self::Generic => "",
        }
    }

    /// Whether gzip variants are produced for this type
    #[must_use]
    pub const fn is_compressible(&self) -> bool {
        matches!(self, Self::Stylesheet | Self::Script)
    }

    /// Map a bundler response MIME type; bundles are either stylesheets or scripts
    #[must_use]
    pub fn from_bundle_mime(mime: &str) -> Self {
        if mime.eq_ignore_ascii_case("text/css") {
            Self::Stylesheet
        } else {
            Self::Script
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// One cacheable asset group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleIdentity {
    /// Application-relative bundle path, e.g. `~/bundles/site`
    pub virtual_path: String,
    /// Container holding sources and artifacts
    pub container: String,
    /// Whether the request arrived over an encrypted connection
    pub secure: bool,
}

impl BundleIdentity {
    /// Create an identity
    #[must_use]
    pub fn new(virtual_path: impl Into<String>, container: impl Into<String>, secure: bool) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            container: container.into(),
            secure,
        }
    }

    /// Response cache key in the given namespace
    #[must_use]
    pub fn cache_key(&self, namespace: &str) -> String {
        cache_key(namespace, &self.virtual_path, self.secure)
    }
}

/// `"<namespace>:<virtual-path>"` with `ssl` appended for encrypted requests
#[must_use]
pub fn cache_key(namespace: &str, virtual_path: &str, secure: bool) -> String {
    format!(
        "{namespace}:{virtual_path}{}",
        if secure { "ssl" } else { "" }
    )
}

/// Remote paths of a bundle's plain artifact and compressed sibling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    /// `<folder>/<file><ext>`, lower-cased
    pub plain: String,
    /// `<folder>/compressed/<file><ext>`, lower-cased
    pub compressed: String,
}

impl ArtifactLayout {
    /// Derive the layout from a bundle virtual path.
    ///
    /// The folder is the virtual path's directory with leading `~` and `/`
    /// and trailing `/` removed. The extension is not doubled when the file
    /// name already carries it.
    #[must_use]
    pub fn for_bundle(virtual_path: &str, content_type: ContentType) -> Self {
        let trimmed = virtual_path.trim_start_matches(['~', '/']);
        let (folder, file) = match trimmed.rfind('/') {
            Some(idx) => (trimmed[..idx].trim_end_matches('/'), &trimmed[idx + 1..]),
            None => ("", trimmed),
        };

        let ext = content_type.extension();
        let file = file.to_lowercase();
        let name = if ext.is_empty() || file.ends_with(ext) {
            file
        } else {
            format!("{file}{ext}")
        };

        let folder = folder.to_lowercase();
        if folder.is_empty() {
            Self {
                plain: name.clone(),
                compressed: format!("{COMPRESSED_DIR}/{name}"),
            }
        } else {
            Self {
                plain: format!("{folder}/{name}"),
                compressed: format!("{folder}/{COMPRESSED_DIR}/{name}"),
            }
        }
    }
}

/// Normalize a source dependency path to a blob path (leading `~` and `/` removed)
#[must_use]
pub fn source_blob_path(virtual_path: &str) -> String {
    virtual_path.trim_start_matches(['~', '/']).to_string()
}
