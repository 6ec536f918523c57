//! Error types for the Kontos library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`KontosError`] enum. Programming-contract violations (seeking an
//! iterator backward, unpacking a document the iterator is not positioned
//! on) are asserted rather than reported, since recovering from them would
//! mask caller defects.
//!
//! # Examples
//!
//! ```
//! use kontos::error::{KontosError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(KontosError::invalid_operation("store is closed"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Kontos operations.
#[derive(Error, Debug)]
pub enum KontosError {
    /// I/O errors (file operations, stream reads/writes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index-related errors.
    #[error("Index error: {0}")]
    Index(String),

    /// Persistence errors: format-version mismatch, truncated or corrupted
    /// record streams. These abort a load; a partially-loaded store is
    /// never returned.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Resource exhausted (e.g. blob reference space).
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid operation for the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with KontosError.
pub type Result<T> = std::result::Result<T, KontosError>;

impl KontosError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        KontosError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        KontosError::Index(msg.into())
    }

    /// Create a new persistence error.
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        KontosError::Persistence(msg.into())
    }

    /// Create a new resource-exhausted error.
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        KontosError::ResourceExhausted(msg.into())
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        KontosError::InvalidOperation(msg.into())
    }
}
