//! Best-effort local cache for datasets.
//!
//! This module provides a write-through cache that:
//! - Stores the latest dataset per logical key under a namespace prefix
//! - Treats entries older than a caller-supplied max age as absent
//! - Never fails the caller: storage errors are logged and swallowed

mod layer;
mod storage;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
