//! Error types for Runlet.
//!
//! This module defines the error types used throughout Runlet, mapping each
//! failure kind onto the HTTP status the invocation surface reports.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Runlet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Runlet.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Resolution Errors
    // ========================================================================
    /// Function missing or inactive.
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),

    /// Active version row is incomplete (empty hash, missing path).
    #[error("Function '{function_id}' has a broken active version: {message}")]
    BrokenVersion {
        /// Function identifier
        function_id: String,
        /// What was wrong with the version row
        message: String,
    },

    // ========================================================================
    // Authentication Errors
    // ========================================================================
    /// API key missing or wrong.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not permitted.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // ========================================================================
    // Package Errors
    // ========================================================================
    /// Archive contents do not match the recorded fingerprint.
    #[error("Bad package for function '{function_id}': {message}")]
    BadPackage {
        /// Function identifier
        function_id: String,
        /// Mismatch details
        message: String,
    },

    /// Archive attempted to write outside its extraction root.
    #[error("Unsafe archive for function '{function_id}': entry '{entry}' escapes the package root")]
    UnsafeArchive {
        /// Function identifier
        function_id: String,
        /// Offending archive entry
        entry: String,
    },

    /// Cache cannot take more data.
    #[error("Package cache is full: {0}")]
    CacheFull(String),

    /// Entry is held by in-flight invocations.
    #[error("Cache entry for function '{0}' is busy")]
    CacheBusy(String),

    // ========================================================================
    // Blob Fetch Errors
    // ========================================================================
    /// Downloaded bytes hash to something other than the recorded hash.
    #[error("Hash mismatch for '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        /// Storage path of the archive
        path: String,
        /// Recorded hash
        expected: String,
        /// Computed hash
        actual: String,
    },

    /// Downloaded byte count differs from the recorded size.
    #[error("Size mismatch for '{path}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Storage path of the archive
        path: String,
        /// Recorded size
        expected: u64,
        /// Received size
        actual: u64,
    },

    /// Blob storage said the object does not exist.
    #[error("Package archive not found at '{0}'")]
    BlobNotFound(String),

    /// Transport failed after exhausting retries.
    #[error("Failed to fetch '{path}': {message}")]
    BlobTransport {
        /// Storage path of the archive
        path: String,
        /// Transport error details
        message: String,
    },

    // ========================================================================
    // Sandbox Errors
    // ========================================================================
    /// Entry file did not export a callable handler.
    #[error("Function did not export a handler (expected a function, .handler, or .default)")]
    BadExport,

    /// Wall-clock deadline expired.
    #[error("Function execution timed out after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds spent before interruption
        elapsed_ms: u64,
    },

    /// Guest breached its memory cap.
    #[error("Function exceeded its memory limit")]
    OutOfMemory,

    /// Uncaught exception inside the guest.
    #[error("Function threw: {message}")]
    Guest {
        /// Error message from the guest
        message: String,
        /// Guest stack trace, when one was captured
        stack: Option<String>,
    },

    /// Handler finished without writing a response or returning a value.
    #[error("Function produced no output")]
    NoOutput,

    /// The sandbox itself failed (engine setup, bridge wiring).
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    // ========================================================================
    // Store Errors
    // ========================================================================
    /// Metadata store hiccup that may succeed on retry.
    #[error("Metadata store error: {0}")]
    StoreTransient(String),

    /// Invalid cron expression on a scheduled function.
    #[error("Invalid cron expression '{expression}': {message}")]
    BadSchedule {
        /// The expression as stored
        expression: String,
        /// Parse failure details
        message: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced path does not exist.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ========================================================================
    // IO / Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new bad-package error.
    pub fn bad_package(function_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadPackage {
            function_id: function_id.into(),
            message: message.into(),
        }
    }

    /// Creates a new unsafe-archive error.
    pub fn unsafe_archive(function_id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self::UnsafeArchive {
            function_id: function_id.into(),
            entry: entry.into(),
        }
    }

    /// Creates a new guest error without a stack trace.
    pub fn guest(message: impl Into<String>) -> Self {
        Self::Guest {
            message: message.into(),
            stack: None,
        }
    }

    /// Creates a new blob transport error.
    pub fn blob_transport(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BlobTransport {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreTransient(_) | Error::CacheFull(_) | Error::BlobTransport { .. }
        )
    }

    /// HTTP status code the invocation surface reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::FunctionNotFound(_) | Error::FileNotFound(_) => 404,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::CacheFull(_) => 503,
            Error::CacheBusy(_) => 409,
            Error::Timeout { .. } => 504,
            Error::BadSchedule { .. } | Error::Config(_) => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::FunctionNotFound("f".into()).status_code(), 404);
        assert_eq!(Error::Unauthorized("no key".into()).status_code(), 401);
        assert_eq!(Error::Timeout { elapsed_ms: 30_000 }.status_code(), 504);
        assert_eq!(Error::CacheFull("disk".into()).status_code(), 503);
        assert_eq!(Error::BadExport.status_code(), 500);
        assert_eq!(Error::OutOfMemory.status_code(), 500);
        assert_eq!(Error::NoOutput.status_code(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::StoreTransient("pool exhausted".into()).is_transient());
        assert!(Error::blob_transport("a/b.tar.gz", "connection reset").is_transient());
        assert!(!Error::BadExport.is_transient());
        assert!(!Error::HashMismatch {
            path: "p".into(),
            expected: "aa".into(),
            actual: "bb".into()
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::unsafe_archive("fn-1", "../../etc/passwd");
        assert!(err.to_string().contains("escapes the package root"));
    }
}
