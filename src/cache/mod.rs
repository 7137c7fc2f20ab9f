//! Query cache shared by every query of a context.
//!
//! This module provides:
//! - Composite query keys (namespace, operation tag, path, search params, user)
//! - Shared in-memory entries with per-key fetch coalescing
//! - Cache-first fetching with a configurable staleness window
//! - Stale fallback when a refresh of a stale entry fails

mod key;
mod layer;
mod traits;

pub use key::QueryKey;
pub use layer::QueryCache;
pub use traits::{now_millis, CacheResult, CacheSource, CachedEntry};
