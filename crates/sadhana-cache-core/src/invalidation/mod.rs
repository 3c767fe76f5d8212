//! Event-driven cache invalidation.
//!
//! When data changes, both the UI's query layer and the `CacheManager` hold
//! copies that must be dropped. Each resource class is an `Invalidation`
//! that knows its structured query key and its flat cache keys or patterns;
//! `DomainEvent`s fan out to a fixed list of invalidations.

mod events;
mod keys;
mod manager;
mod query;

pub use events::{CacheTarget, DomainEvent, Invalidation};
pub use keys::QueryKey;
pub use manager::InvalidationManager;
pub use query::{NoopQueryLayer, QueryLayer};
