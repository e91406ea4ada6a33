//! Context cache
//!
//! ```text
//!   key text ──sha256──► ContentHash ──► slot ──► ContextHandle (refcounted)
//!                                        │
//!                                        └─ built once by the caller's builder
//! ```
//!
//! Features:
//! - One build per content hash, even under concurrent lookups
//! - Reference-counted handles with a release hook
//! - LRU purge beyond the configured capacity
//! - Statistics and a text dump for diagnostics

mod context_cache;
mod handle;

pub use context_cache::{CacheConfig, CacheEntryInfo, CacheStats, ContentHash, ContextCache};
pub use handle::{ContextHandle, HandleBuilder};

/// Default capacity of the context cache
pub const DEFAULT_MAX_ENTRIES: usize = 512;
