//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite database operations
//! - Per-key lock table
//! - Entity and ID-list caches (volatile)

mod cache;
mod database;
mod locks;
mod models;

pub use cache::{
    CacheKey, Cacheable, Caches, EntityCache, IdList, IdListCache, InvalidateHook, lookup,
};
pub use database::Database;
pub use locks::{DEFAULT_GC_FREQUENCY, KeyLockGuard, KeyLockTable, LockKind};
pub use models::*;

#[cfg(test)]
mod database_test;
