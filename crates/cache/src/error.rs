//! Error types for the artifact cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(kiln::cache::io),
        help("Check file permissions and available disk space under the cache root")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "copy")
        operation: String,
    },

    /// A declared source file could not be read while fingerprinting
    #[error("Source file {} could not be hashed", path.display())]
    #[diagnostic(
        code(kiln::cache::missing_input),
        help("Every declared source must be readable; a skipped file would make the fingerprint stale")
    )]
    MissingInput {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// The source file that could not be read
        path: Box<Path>,
    },

    /// Configuration error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(kiln::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Malformed value handed to the cache (e.g. a fingerprint that is not hex)
    #[error("Validation error: {message}")]
    #[diagnostic(code(kiln::cache::validation))]
    Validation {
        /// Description of the invalid value
        message: String,
    },

    /// Cache entry not found
    #[error("Cache entry not found: {fingerprint}")]
    #[diagnostic(
        code(kiln::cache::not_found),
        help("The entry may have been evicted, expired, or never stored")
    )]
    NotFound {
        /// The fingerprint that was not found
        fingerprint: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(kiln::cache::serialization))]
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

    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// Create a missing-input error for an unreadable source file
    #[must_use]
    pub fn missing_input(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::MissingInput {
            source,
            path: path.as_ref().into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(fingerprint: impl Into<String>) -> Self {
        Self::NotFound {
            fingerprint: fingerprint.into(),
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

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
