//! Asset cache: persistent per-URL records plus a bounded in-memory LRU.
//!
//! - [`AssetCache`] remembers where each source URL was materialized on disk
//!   and survives across runs.
//! - [`LruCache`] is a small in-process map used to memoize cheap-but-repeated
//!   work such as URL validation.

mod lru;
mod store;

pub use lru::{DEFAULT_LRU_CAPACITY, LruCache};
pub use store::{AssetCache, CacheEntry, CacheError, DEFAULT_CACHE_TTL, cache_key};
