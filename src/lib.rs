//! # Kontos
//!
//! Concurrent in-memory indexing and attribute-value storage primitives for
//! search engines, following the attribute/memory-index design of Vespa.
//!
//! ## Features
//!
//! - Generation (epoch) tracking with RAII reader guards
//! - Blob store with deferred reclamation and compaction
//! - Ordered posting index with copy-on-write structural updates
//! - Strict, forward-only posting iterators with lazy feature unpacking
//! - Attribute value store with committed-visibility semantics
//! - Versioned, checksummed on-disk persistence
//!
//! Readers never block the writer and the writer never blocks readers:
//! published payloads and tree nodes are immutable, and superseded data is
//! retired through per-generation hold lists that are only drained once no
//! reader guard can still observe them.

pub mod attribute;
pub mod blob;
pub mod error;
pub mod generation;
pub mod persistence;
pub mod posting;
pub mod storage;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
