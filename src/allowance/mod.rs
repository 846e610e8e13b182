//! Allowance persistence: the storage contract and its cache-backed
//! implementation.

mod cache;
mod cache_store;
mod store;

pub use cache::{Cache, MemoryCache, NullCache, DEFAULT_PURGE_INTERVAL};
pub use cache_store::{
    CacheAllowanceStore, CACHE_STORE_IDENTITY, DEFAULT_ALLOWANCE, DEFAULT_CACHE_KEY_PREFIX,
};
pub use store::{AllowanceRecord, AllowanceStore};
