//! Error types for bundle publishing and invalidation

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for bundlecdn operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Required configuration is missing or malformed
    #[error("Bundle configuration error: {message}")]
    #[diagnostic(
        code(bundlecdn::config),
        help(
            "Set the account name and access key in the settings file or via BUNDLECDN_ACCOUNT_NAME / BUNDLECDN_ACCESS_KEY"
        )
    )]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A remote store write failed; the artifact was not published
    #[error("Failed to {operation} {container}/{path}")]
    #[diagnostic(
        code(bundlecdn::publish),
        help("The bundle request fails rather than serving a stale or missing artifact")
    )]
    Publish {
        /// The underlying blob store error
        #[source]
        source: bundlecdn_blobstore::Error,
        /// Operation that failed (e.g., "write plain artifact")
        operation: String,
        /// Target container
        container: String,
        /// Target blob path
        path: String,
    },

    /// Gzip encoding failed
    #[error("Compression failed: {source}")]
    #[diagnostic(code(bundlecdn::compression))]
    Compression {
        /// The underlying I/O error from the encoder
        #[source]
        source: std::io::Error,
    },

    /// The bundle pipeline could not produce content
    #[error("Failed to generate bundle {virtual_path}: {message}")]
    #[diagnostic(code(bundlecdn::generate))]
    Generation {
        /// Virtual path of the bundle
        virtual_path: String,
        /// Description of the failure
        message: String,
    },

    /// I/O error while reading configuration
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(bundlecdn::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read")
        operation: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(bundlecdn::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a publish error for a failed remote write
    #[must_use]
    pub fn publish(
        source: bundlecdn_blobstore::Error,
        operation: impl Into<String>,
        container: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::Publish {
            source,
            operation: operation.into(),
            container: container.into(),
            path: path.into(),
        }
    }

    /// Create a generation error
    #[must_use]
    pub fn generation(virtual_path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Generation {
            virtual_path: virtual_path.into(),
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

/// Result type for bundlecdn operations
pub type Result<T> = std::result::Result<T, Error>;
