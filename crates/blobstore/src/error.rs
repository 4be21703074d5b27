//! Error types for the blob store crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for blob store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The named blob does not exist
    #[error("Blob not found: {container}/{path}")]
    #[diagnostic(
        code(bundlecdn::blobstore::not_found),
        help("Blob paths are case-sensitive; check the container and path casing")
    )]
    NotFound {
        /// Container that was queried
        container: String,
        /// Blob path within the container
        path: String,
    },

    /// The remote store could not be reached or rejected the request
    #[error("Blob store {operation} failed for {container}/{path}: {message}")]
    #[diagnostic(
        code(bundlecdn::blobstore::unavailable),
        help("The remote store may be temporarily unreachable")
    )]
    Unavailable {
        /// Operation that failed (e.g., "read", "write", "last_modified")
        operation: String,
        /// Container that was addressed
        container: String,
        /// Blob path within the container
        path: String,
        /// Backend-specific failure description
        message: String,
    },

    /// I/O error in a filesystem-backed store
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(bundlecdn::blobstore::io),
        help("Check file permissions and ensure the store root exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create_dir_all")
        operation: String,
    },

    /// A container or blob path that cannot be addressed safely
    #[error("Invalid blob path '{path}': {reason}")]
    #[diagnostic(code(bundlecdn::blobstore::invalid_path))]
    InvalidPath {
        /// The rejected path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Serialization error for blob metadata
    #[error("Serialization error: {message}")]
    #[diagnostic(code(bundlecdn::blobstore::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create a not found error
    #[must_use]
    pub fn not_found(container: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotFound {
            container: container.into(),
            path: path.into(),
        }
    }

    /// Create a remote-unavailable error
    #[must_use]
    pub fn unavailable(
        operation: impl Into<String>,
        container: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            container: container.into(),
            path: path.into(),
            message: message.into(),
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

    /// Create an invalid path error
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error means the blob is simply absent
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for blob store operations
pub type Result<T> = std::result::Result<T, Error>;
