//! Two-tier caching module.
//!
//! This module provides the `CacheManager`, which keeps entries in an
//! in-process map and mirrors them to a persistent key/value backend so they
//! survive restarts. Entries carry their own TTL and an optional scope (the
//! active user id) that isolates identities sharing one device.
//!
//! Persistent-tier keys follow `cache:<scope>:<key>` for scoped entries and
//! `cache:<key>` for global ones.

pub mod clock;
pub mod entry;
pub mod manager;
pub mod pattern;
pub mod stats;
pub mod storage;

pub use clock::{Clock, MockClock, SystemClock};
pub use entry::CacheEntry;
pub use manager::{CacheManager, SweepHandle};
pub use pattern::KeyPattern;
pub use stats::{CacheStats, PersistentStats};
pub use storage::{FileStore, MemoryStore, PersistentStore};
