use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::Duration;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::entry::{storage_key, unscoped_key, CacheEntry, STORAGE_PREFIX};
use super::pattern::KeyPattern;
use super::stats::{CacheStats, PersistentStats, StatsCollector};
use super::storage::{FileStore, PersistentStore};
use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::lock::{rw_read, rw_write};

/// Smallest sweep period accepted by `spawn_sweeper`.
const MIN_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);

/// Memory-tier key: `(scope, key)`.
type MemoryKey = (Option<String>, String);

fn memory_key(key: &str, scope: Option<&str>) -> MemoryKey {
    (scope.map(str::to_string), key.to_string())
}

/// Two-tier cache: an authoritative in-process map mirrored to a bounded
/// persistent backend.
///
/// Caching is best-effort. Apart from fetch errors surfaced by `get_or_set`,
/// no operation returns an error; persistence problems are logged and the
/// cache degrades to memory-only storage or a miss.
///
/// Share one instance per application as `Arc<CacheManager>`.
pub struct CacheManager {
    /// Keyed by `(scope, key)`. Storage keys are ambiguous: the global key
    /// `u1:books` and `books` in scope `u1` both map to `cache:u1:books`.
    memory: RwLock<HashMap<MemoryKey, CacheEntry<Value>>>,
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    stats: StatsCollector,
}

impl CacheManager {
    pub fn new(store: Arc<dyn PersistentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            store,
            clock,
            stats: StatsCollector::default(),
        }
    }

    /// Open a cache backed by a `FileStore` in the configured cache directory.
    pub fn open(settings: &CacheSettings) -> anyhow::Result<Self> {
        let dir = settings.cache_dir()?;
        let store = FileStore::open(dir, settings.max_persistent_bytes)?;
        Ok(Self::new(Arc::new(store), Arc::new(SystemClock)))
    }

    // ===== Writes =====

    /// Store `value` under `key`. The memory tier is always written; the
    /// persistent tier is attempted and, if full, the oldest persistent entry
    /// is evicted and the write retried once.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, scope: Option<&str>) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, ?scope, error = %e, "Value is not serializable, not caching");
                return;
            }
        };

        let entry = CacheEntry::new(data, self.clock.now(), ttl, scope.map(str::to_string));
        let skey = storage_key(key, scope);

        rw_write(&self.memory, "set").insert(memory_key(key, scope), entry.clone());
        self.persist(&skey, &entry);
    }

    fn persist(&self, skey: &str, entry: &CacheEntry<Value>) {
        let serialized = match serde_json::to_string(entry) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = skey, error = %e, "Failed to serialize entry, keeping it in memory only");
                return;
            }
        };

        match self.store.set_item(skey, &serialized) {
            Ok(()) => {}
            Err(e) if e.is_quota_exceeded() => {
                debug!(key = skey, error = %e, "Persistent tier full, evicting oldest entry");
                self.evict_oldest_persistent();
                if let Err(e) = self.store.set_item(skey, &serialized) {
                    warn!(key = skey, error = %e, "Persistent tier still full, using memory only");
                }
            }
            Err(e) => {
                warn!(key = skey, error = %e, "Persistent write failed, using memory only");
            }
        }
    }

    /// Remove the persistent entry with the oldest write timestamp.
    fn evict_oldest_persistent(&self) {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Could not list persistent tier for eviction");
                return;
            }
        };

        let oldest = keys
            .into_iter()
            .filter(|k| k.starts_with(STORAGE_PREFIX))
            .filter_map(|k| {
                let header = self.load_header(&k).ok()??;
                Some((header.timestamp, k))
            })
            .min_by_key(|(timestamp, _)| *timestamp);

        let Some((timestamp, key)) = oldest else {
            return;
        };
        // Only evict the entry that was measured; a rewrite makes it the newest
        let unchanged = |raw: &str| read_header(raw).is_ok_and(|h| h.timestamp == timestamp);
        match self.store.remove_if(&key, &unchanged) {
            Ok(true) => debug!(key = %key, "Evicted oldest persistent entry"),
            Ok(false) => debug!(key = %key, "Oldest entry was rewritten, not evicting"),
            Err(e) => warn!(key = %key, error = %e, "Failed to evict persistent entry"),
        }
    }

    // ===== Reads =====

    /// Look up a fresh value. Memory is checked first, then the persistent
    /// tier; a fresh persistent entry is promoted into memory.
    ///
    /// Stale entries read as absent but are left in place until deleted or
    /// swept. A value that does not deserialize into `T` is a miss, and so is
    /// a persistent entry written under a different scope.
    pub fn get<T: DeserializeOwned>(&self, key: &str, scope: Option<&str>) -> Option<T> {
        let mkey = memory_key(key, scope);
        let skey = storage_key(key, scope);
        let now = self.clock.now();

        let in_memory = rw_read(&self.memory, "get")
            .get(&mkey)
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| entry.data.clone());

        if let Some(data) = in_memory {
            return self.decode_hit(&skey, data);
        }

        match self.load_entry(&skey) {
            Ok(Some(entry)) if entry.scope.as_deref() != scope => {
                self.stats.record_miss();
                debug!(key = %skey, owner = ?entry.scope, "Persistent entry belongs to another scope");
                None
            }
            Ok(Some(entry)) if entry.is_fresh_at(now) => {
                let data = entry.data.clone();
                rw_write(&self.memory, "get.promote").insert(mkey, entry);
                debug!(key = %skey, "Promoted persistent entry into memory");
                self.decode_hit(&skey, data)
            }
            Ok(_) => {
                self.stats.record_miss();
                debug!(key = %skey, "Cache miss");
                None
            }
            Err(CacheError::Serialization(e)) => {
                warn!(key = %skey, error = %e, "Purging unreadable persistent entry");
                let unreadable = |raw: &str| read_header(raw).is_err();
                if let Err(e) = self.store.remove_if(&skey, &unreadable) {
                    warn!(key = %skey, error = %e, "Failed to purge unreadable entry");
                }
                self.stats.record_miss();
                None
            }
            Err(e) => {
                warn!(key = %skey, error = %e, "Persistent read failed, treating as miss");
                self.stats.record_miss();
                None
            }
        }
    }

    fn decode_hit<T: DeserializeOwned>(&self, skey: &str, data: Value) -> Option<T> {
        match serde_json::from_value(data) {
            Ok(value) => {
                self.stats.record_hit();
                debug!(key = skey, "Cache hit");
                Some(value)
            }
            Err(e) => {
                self.stats.record_miss();
                debug!(key = skey, error = %e, "Cached value has unexpected shape, treating as miss");
                None
            }
        }
    }

    fn load_entry(&self, skey: &str) -> Result<Option<CacheEntry<Value>>, CacheError> {
        match self.store.get_item(skey)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn load_header(&self, skey: &str) -> Result<Option<CacheEntry<IgnoredAny>>, CacheError> {
        match self.store.get_item(skey)? {
            Some(raw) => Ok(Some(read_header(&raw)?)),
            None => Ok(None),
        }
    }

    /// Return the cached value if fresh, otherwise run `fetch`, cache its
    /// result and return it.
    ///
    /// Fetch errors are returned unchanged and nothing is cached. Concurrent
    /// callers that miss on the same key each run their own fetch; there is
    /// no in-flight de-duplication, and the last `set` wins.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key, scope) {
            return Ok(cached);
        }

        let value = fetch().await?;
        self.set(key, &value, ttl, scope);
        Ok(value)
    }

    // ===== Deletes =====

    /// Remove `key` from both tiers. Returns whether it existed; false if the
    /// persistent tier could not be consulted.
    ///
    /// A persistent entry owned by another scope under the same storage key
    /// is left alone. Unreadable entries are removed.
    pub fn delete(&self, key: &str, scope: Option<&str>) -> bool {
        let skey = storage_key(key, scope);
        let in_memory = rw_write(&self.memory, "delete")
            .remove(&memory_key(key, scope))
            .is_some();

        let owned = |raw: &str| read_header(raw).map_or(true, |h| h.scope.as_deref() == scope);
        let persisted = match self.store.remove_if(&skey, &owned) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %skey, error = %e, "Persistent delete failed");
                return false;
            }
        };

        in_memory || persisted
    }

    /// Remove every entry whose unscoped key matches `glob`.
    ///
    /// With a scope, entries of that scope and global entries are matched;
    /// without one, only global entries are. Each logical entry counts once
    /// even when it was present in both tiers.
    pub fn delete_pattern(&self, glob: &str, scope: Option<&str>) -> usize {
        let pattern = match KeyPattern::compile(glob) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(pattern = glob, error = %e, "Invalid key pattern, nothing deleted");
                return 0;
            }
        };

        let mut removed: HashSet<String> = HashSet::new();

        rw_write(&self.memory, "delete_pattern").retain(|(entry_scope, key), _| {
            let entry_scope = entry_scope.as_deref();
            let matched = in_partition(entry_scope, scope) && pattern.matches(key);
            if matched {
                removed.insert(storage_key(key, entry_scope));
            }
            !matched
        });

        for skey in self.persistent_keys() {
            // Cheap key-only filter before reading the entry to confirm its scope
            let candidate = scope
                .and_then(|s| unscoped_key(&skey, Some(s)))
                .is_some_and(|k| pattern.matches(k))
                || unscoped_key(&skey, None).is_some_and(|k| pattern.matches(k));
            if !candidate {
                continue;
            }

            let entry_scope = match self.load_header(&skey) {
                Ok(Some(header)) => header.scope,
                Ok(None) => continue,
                Err(e) => {
                    debug!(key = %skey, error = %e, "Skipping unreadable entry during pattern delete");
                    continue;
                }
            };
            let entry_scope = entry_scope.as_deref();
            let matched = in_partition(entry_scope, scope)
                && unscoped_key(&skey, entry_scope).is_some_and(|k| pattern.matches(k));
            if !matched {
                continue;
            }

            match self.store.remove_item(&skey) {
                Ok(()) => {
                    removed.insert(skey);
                }
                Err(e) => warn!(key = %skey, error = %e, "Persistent delete failed"),
            }
        }

        debug!(pattern = pattern.as_str(), ?scope, removed = removed.len(), "Pattern delete complete");
        removed.len()
    }

    /// Remove all entries of `scope` from both tiers, or everything when
    /// `scope` is `None`. Returns the number of logical entries removed.
    ///
    /// Hit/miss counters are not reset; see `reset_stats`.
    pub fn clear(&self, scope: Option<&str>) -> usize {
        let mut removed: HashSet<String> = HashSet::new();

        {
            let mut memory = rw_write(&self.memory, "clear");
            match scope {
                Some(s) => memory.retain(|(entry_scope, key), _| {
                    let owned = entry_scope.as_deref() == Some(s);
                    if owned {
                        removed.insert(storage_key(key, Some(s)));
                    }
                    !owned
                }),
                None => removed.extend(
                    memory
                        .drain()
                        .map(|((entry_scope, key), _)| storage_key(&key, entry_scope.as_deref())),
                ),
            }
        }

        for skey in self.persistent_keys() {
            if let Some(s) = scope {
                if unscoped_key(&skey, Some(s)).is_none() {
                    continue;
                }
                // A global key may itself start with `<scope>:`; leave it alone
                if let Ok(Some(header)) = self.load_header(&skey) {
                    if header.scope.as_deref() != Some(s) {
                        continue;
                    }
                }
            }

            match self.store.remove_item(&skey) {
                Ok(()) => {
                    removed.insert(skey);
                }
                Err(e) => warn!(key = %skey, error = %e, "Persistent delete failed during clear"),
            }
        }

        info!(?scope, removed = removed.len(), "Cache cleared");
        removed.len()
    }

    // ===== Expiry =====

    /// Remove every expired entry from both tiers. Unreadable persistent
    /// entries are removed as well. Returns the number of logical entries
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed: HashSet<String> = HashSet::new();

        rw_write(&self.memory, "sweep").retain(|(entry_scope, key), entry| {
            let stale = entry.is_stale_at(now);
            if stale {
                removed.insert(storage_key(key, entry_scope.as_deref()));
            }
            !stale
        });

        // Re-checked under the store lock so an entry rewritten after the
        // header read survives.
        let expired = |raw: &str| read_header(raw).map_or(true, |h| h.is_stale_at(now));

        let mut invalid = 0;
        for skey in self.persistent_keys() {
            let (candidate, unreadable) = match self.load_header(&skey) {
                Ok(Some(header)) => (header.is_stale_at(now), false),
                Ok(None) => (false, false),
                Err(CacheError::Serialization(_)) => (true, true),
                Err(e) => {
                    warn!(key = %skey, error = %e, "Persistent read failed during sweep");
                    (false, false)
                }
            };
            if !candidate {
                continue;
            }

            match self.store.remove_if(&skey, &expired) {
                Ok(true) => {
                    if unreadable {
                        invalid += 1;
                    }
                    removed.insert(skey);
                }
                Ok(false) => debug!(key = %skey, "Entry rewritten during sweep, keeping it"),
                Err(e) => warn!(key = %skey, error = %e, "Persistent delete failed during sweep"),
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), invalid, "Swept expired cache entries");
        }
        removed.len()
    }

    /// Run `sweep` every `interval` on the tokio runtime until the returned
    /// handle is shut down or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> SweepHandle {
        let cache = Arc::clone(self);
        let interval = interval.max(MIN_SWEEP_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                ticker.tick().await;
                let cache = Arc::clone(&cache);
                if let Err(e) = tokio::task::spawn_blocking(move || cache.sweep()).await {
                    warn!(error = %e, "Cache sweep task failed");
                }
            }
        });

        info!(?interval, "Cache sweeper started");
        SweepHandle {
            handle: Some(handle),
        }
    }

    // ===== Introspection =====

    pub fn get_stats(&self) -> CacheStats {
        let memory = rw_read(&self.memory, "get_stats");
        let size = memory
            .values()
            .map(|entry| serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(0))
            .sum();
        self.stats.snapshot(size, memory.len())
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Storage keys of every cache entry in the persistent tier.
    pub fn persistent_keys(&self) -> Vec<String> {
        match self.store.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| k.starts_with(STORAGE_PREFIX))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not list persistent tier");
                Vec::new()
            }
        }
    }

    /// Metadata of every readable persistent entry, by storage key.
    pub fn persistent_entries(&self) -> Vec<(String, CacheEntry<()>)> {
        self.persistent_keys()
            .into_iter()
            .filter_map(|skey| match self.load_header(&skey) {
                Ok(Some(header)) => Some((skey, header.map(|_| ()))),
                Ok(None) => None,
                Err(e) => {
                    debug!(key = %skey, error = %e, "Skipping unreadable entry");
                    None
                }
            })
            .collect()
    }

    /// Entry counts and stored size of the persistent tier.
    pub fn persistent_stats(&self) -> PersistentStats {
        let now = self.clock.now();
        let mut stats = PersistentStats::default();

        for skey in self.persistent_keys() {
            let raw = match self.store.get_item(&skey) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %skey, error = %e, "Persistent read failed during stats");
                    continue;
                }
            };

            stats.entries += 1;
            stats.bytes += (skey.len() + raw.len()) as u64;
            match read_header(&raw) {
                Ok(header) if header.is_fresh_at(now) => stats.fresh += 1,
                Ok(_) => stats.stale += 1,
                Err(_) => stats.unreadable += 1,
            }
        }
        stats
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

/// Parse an entry's metadata without materializing its data.
fn read_header(raw: &str) -> Result<CacheEntry<IgnoredAny>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Whether an entry written under `entry_scope` is visible to an operation
/// on `scope`: its own partition plus global entries.
fn in_partition(entry_scope: Option<&str>, scope: Option<&str>) -> bool {
    entry_scope.is_none() || entry_scope == scope
}

/// Handle to the background sweep task. Dropping it stops the sweeper.
pub struct SweepHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Stop the sweeper and wait for the task to wind down.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
            info!("Cache sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use proptest::prelude::*;

    use super::*;
    use crate::cache::clock::MockClock;
    use crate::cache::storage::MemoryStore;

    fn fresh_cache() -> (CacheManager, MockClock) {
        let clock = MockClock::new();
        let cache = CacheManager::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        (cache, clock)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// A value is readable immediately after it is written with a positive TTL.
        #[test]
        fn prop_fresh_after_set(
            key in "[a-z]{1,8}(:[a-z0-9]{1,8}){0,3}",
            value in any::<i64>(),
            ttl_ms in 1i64..10_000_000,
        ) {
            let (cache, _) = fresh_cache();
            cache.set(&key, &value, Duration::milliseconds(ttl_ms), None);
            prop_assert_eq!(cache.get::<i64>(&key, None), Some(value));
        }

        /// Once the TTL has elapsed the value is gone from both tiers' point of view.
        #[test]
        fn prop_absent_after_ttl(
            key in "[a-z]{1,8}(:[a-z0-9]{1,8}){0,3}",
            value in any::<i64>(),
            ttl_ms in -1000i64..100_000,
        ) {
            let (cache, clock) = fresh_cache();
            cache.set(&key, &value, Duration::milliseconds(ttl_ms), None);
            clock.advance_millis(ttl_ms.max(0));
            prop_assert_eq!(cache.get::<i64>(&key, None), None);
        }

        /// Entries written under one scope are never visible from another.
        #[test]
        fn prop_scope_isolation(
            key in "[a-z]{1,8}(:[a-z0-9]{1,8}){0,3}",
            owner in "[a-z0-9]{1,6}",
            other in "[a-z0-9]{1,6}",
            value in any::<i64>(),
        ) {
            prop_assume!(owner != other);
            let (cache, _) = fresh_cache();
            cache.set(&key, &value, Duration::minutes(5), Some(&owner));
            prop_assert_eq!(cache.get::<i64>(&key, Some(&other)), None);
            prop_assert_eq!(cache.get::<i64>(&key, None), None);
            prop_assert_eq!(cache.get::<i64>(&key, Some(&owner)), Some(value));
        }
    }
}
