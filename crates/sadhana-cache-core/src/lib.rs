//! Client-side caching for the sadhana tracker.
//!
//! This crate provides:
//! - `CacheManager`: a two-tier (memory + persistent) TTL cache, partitioned
//!   by an optional scope such as the signed-in user's id
//! - `InvalidationManager`: maps domain mutations onto targeted cache and
//!   query-layer invalidations
//! - `CacheSettings`: on-disk configuration for cache location and limits

pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
mod lock;

pub use cache::{
    CacheEntry, CacheManager, CacheStats, Clock, FileStore, KeyPattern, MemoryStore, MockClock,
    PersistentStats, PersistentStore, SweepHandle, SystemClock,
};
pub use config::CacheSettings;
pub use error::{CacheError, EventError, StorageError};
pub use invalidation::{
    CacheTarget, DomainEvent, Invalidation, InvalidationManager, NoopQueryLayer, QueryKey,
    QueryLayer,
};
