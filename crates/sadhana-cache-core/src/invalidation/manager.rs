use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use super::events::{CacheTarget, DomainEvent, Invalidation};
use super::query::QueryLayer;
use crate::cache::{CacheManager, CacheStats};
use crate::lock::{rw_read, rw_write};

/// Translates resource changes into query-layer and cache-store
/// invalidations for the active user.
///
/// Every invalidation is idempotent: invalidating something that is not
/// cached does nothing.
pub struct InvalidationManager {
    cache: Arc<CacheManager>,
    query: Arc<dyn QueryLayer>,
    user_id: RwLock<Option<String>>,
}

impl InvalidationManager {
    pub fn new(cache: Arc<CacheManager>, query: Arc<dyn QueryLayer>) -> Self {
        Self {
            cache,
            query,
            user_id: RwLock::new(None),
        }
    }

    // ===== User scope =====

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let mut current = rw_write(&self.user_id, "set_user_id");
        if let Some(previous) = current.as_deref() {
            if previous != user_id {
                warn!(previous, next = %user_id, "Switching user without clearing the previous one");
            }
        }
        debug!(user_id = %user_id, "Cache invalidation scope set");
        *current = Some(user_id);
    }

    pub fn clear_user_id(&self) {
        *rw_write(&self.user_id, "clear_user_id") = None;
    }

    pub fn user_id(&self) -> Option<String> {
        rw_read(&self.user_id, "user_id").clone()
    }

    // ===== Core =====

    /// Apply one invalidation. Returns the number of cache-store entries
    /// removed.
    ///
    /// Exact keys are removed from the active user's scope and from the
    /// global partition, matching what pattern deletes cover.
    pub fn invalidate(&self, invalidation: &Invalidation) -> usize {
        let scope = self.user_id();
        let scope = scope.as_deref();

        if let Some(key) = invalidation.query_key() {
            self.query.invalidate(&key);
        }

        let mut removed = 0;
        for target in invalidation.cache_targets() {
            match target {
                CacheTarget::Key(key) => {
                    if scope.is_some() && self.cache.delete(&key, scope) {
                        removed += 1;
                    }
                    if self.cache.delete(&key, None) {
                        removed += 1;
                    }
                }
                CacheTarget::Pattern(pattern) => {
                    removed += self.cache.delete_pattern(pattern, scope);
                }
            }
        }

        debug!(?invalidation, ?scope, removed, "Invalidated");
        removed
    }

    /// Apply every invalidation a domain event implies.
    pub fn handle(&self, event: &DomainEvent) -> usize {
        let removed: usize = event
            .invalidations()
            .iter()
            .map(|invalidation| self.invalidate(invalidation))
            .sum();
        info!(%event, removed, "Handled domain event");
        removed
    }

    // ===== Books =====

    pub fn invalidate_books(&self) {
        self.invalidate(&Invalidation::Books);
    }

    pub fn invalidate_book(&self, book_id: &str) {
        self.invalidate(&Invalidation::Book(book_id.to_string()));
    }

    pub fn invalidate_book_search(&self) {
        self.invalidate(&Invalidation::BookSearch);
    }

    // ===== Sadhanas =====

    pub fn invalidate_sadhanas(&self) {
        self.invalidate(&Invalidation::Sadhanas);
    }

    pub fn invalidate_sadhana(&self, sadhana_id: &str) {
        self.invalidate(&Invalidation::Sadhana(sadhana_id.to_string()));
    }

    pub fn invalidate_sadhana_progress(&self, sadhana_id: &str) {
        self.invalidate(&Invalidation::SadhanaProgress(sadhana_id.to_string()));
    }

    pub fn invalidate_sadhana_stats(&self) {
        self.invalidate(&Invalidation::SadhanaStats);
    }

    // ===== Profile =====

    pub fn invalidate_profile(&self) {
        self.invalidate(&Invalidation::Profile);
    }

    pub fn invalidate_settings(&self) {
        self.invalidate(&Invalidation::Settings);
    }

    pub fn invalidate_user_data(&self) {
        self.invalidate_profile();
        self.invalidate_settings();
    }

    // ===== Community =====

    pub fn invalidate_community_feed(&self) {
        self.invalidate(&Invalidation::CommunityFeed);
    }

    pub fn invalidate_post(&self, post_id: &str) {
        self.invalidate(&Invalidation::Post(post_id.to_string()));
    }

    pub fn invalidate_post_comments(&self, post_id: &str) {
        self.invalidate(&Invalidation::PostComments(post_id.to_string()));
    }

    pub fn invalidate_community_stats(&self) {
        self.invalidate(&Invalidation::CommunityStats);
    }

    // ===== Analytics =====

    pub fn invalidate_analytics(&self) {
        self.invalidate(&Invalidation::Analytics);
    }

    pub fn invalidate_user_progress(&self) {
        self.invalidate(&Invalidation::UserProgress);
    }

    pub fn invalidate_practice_trends(&self) {
        self.invalidate(&Invalidation::PracticeTrends);
    }

    pub fn invalidate_completion_rates(&self) {
        self.invalidate(&Invalidation::CompletionRates);
    }

    // ===== Bulk =====

    /// Drop the active user's cache entries and the whole query layer.
    pub fn clear_user_cache(&self) {
        if let Some(user_id) = self.user_id() {
            self.cache.clear(Some(&user_id));
        }
        self.query.clear();
    }

    pub fn clear_all(&self) {
        self.cache.clear(None);
        self.query.clear();
    }

    // ===== Event handlers =====

    pub fn on_sadhana_completed(&self, sadhana_id: &str) {
        self.handle(&DomainEvent::SadhanaCompleted {
            sadhana_id: sadhana_id.to_string(),
        });
    }

    pub fn on_sadhana_progress_updated(&self, sadhana_id: &str) {
        self.handle(&DomainEvent::SadhanaProgressUpdated {
            sadhana_id: sadhana_id.to_string(),
        });
    }

    pub fn on_new_post(&self) {
        self.handle(&DomainEvent::NewPost);
    }

    pub fn on_post_liked(&self, post_id: &str) {
        self.handle(&DomainEvent::PostLiked {
            post_id: post_id.to_string(),
        });
    }

    pub fn on_profile_updated(&self) {
        self.handle(&DomainEvent::ProfileUpdated);
    }

    pub fn on_user_activity(&self) {
        self.handle(&DomainEvent::UserActivity);
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Duration;

    use super::*;
    use crate::cache::{MemoryStore, MockClock};
    use crate::invalidation::QueryKey;

    #[derive(Default)]
    struct RecordingQueryLayer {
        invalidated: Mutex<Vec<QueryKey>>,
        clears: Mutex<usize>,
    }

    impl RecordingQueryLayer {
        fn invalidated(&self) -> Vec<QueryKey> {
            self.invalidated.lock().expect("lock").clone()
        }

        fn clears(&self) -> usize {
            *self.clears.lock().expect("lock")
        }
    }

    impl QueryLayer for RecordingQueryLayer {
        fn invalidate(&self, key: &QueryKey) {
            self.invalidated.lock().expect("lock").push(key.clone());
        }

        fn clear(&self) {
            *self.clears.lock().expect("lock") += 1;
        }
    }

    fn setup() -> (InvalidationManager, Arc<CacheManager>, Arc<RecordingQueryLayer>) {
        let cache = Arc::new(CacheManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockClock::new()),
        ));
        let query = Arc::new(RecordingQueryLayer::default());
        let manager = InvalidationManager::new(cache.clone(), query.clone());
        (manager, cache, query)
    }

    fn ttl() -> Duration {
        Duration::minutes(5)
    }

    #[test]
    fn test_invalidate_book_hits_both_layers() {
        let (manager, cache, query) = setup();
        manager.set_user_id("u1");
        cache.set("books:7", &"Upanishads", ttl(), Some("u1"));

        manager.invalidate_book("7");

        assert!(cache.get::<String>("books:7", Some("u1")).is_none());
        assert_eq!(query.invalidated(), vec![QueryKey::book_detail("7")]);
    }

    #[test]
    fn test_invalidate_books_pattern_keeps_other_users() {
        let (manager, cache, _) = setup();
        manager.set_user_id("u1");
        cache.set("books:1", &1, ttl(), Some("u1"));
        cache.set("books:search:gita", &2, ttl(), Some("u1"));
        cache.set("books:1", &3, ttl(), Some("u2"));

        assert_eq!(manager.invalidate(&Invalidation::Books), 2);
        assert_eq!(cache.get::<i32>("books:1", Some("u2")), Some(3));
    }

    #[test]
    fn test_invalidation_is_idempotent() {
        let (manager, _, query) = setup();
        assert_eq!(manager.invalidate(&Invalidation::Sadhana("s1".to_string())), 0);
        assert_eq!(manager.invalidate(&Invalidation::Sadhana("s1".to_string())), 0);
        assert_eq!(query.invalidated().len(), 2);
    }

    #[test]
    fn test_exact_key_also_removes_global_copy() {
        let (manager, cache, _) = setup();
        manager.set_user_id("u1");
        cache.set("profile:detail", &"scoped", ttl(), Some("u1"));
        cache.set("profile:detail", &"global", ttl(), None);

        assert_eq!(manager.invalidate(&Invalidation::Profile), 2);
        assert!(cache.get::<String>("profile:detail", None).is_none());
    }

    #[test]
    fn test_stats_invalidation_skips_query_layer() {
        let (manager, cache, query) = setup();
        cache.set("community:stats", &10, ttl(), None);

        manager.invalidate_community_stats();

        assert!(cache.get::<i32>("community:stats", None).is_none());
        assert!(query.invalidated().is_empty());
    }

    #[test]
    fn test_community_feed_covers_base_and_variants() {
        let (manager, cache, _) = setup();
        cache.set("community:feed", &1, ttl(), None);
        cache.set("community:feed:page:2", &2, ttl(), None);
        cache.set("community:post:p1", &3, ttl(), None);

        assert_eq!(manager.invalidate(&Invalidation::CommunityFeed), 2);
        assert_eq!(cache.get::<i32>("community:post:p1", None), Some(3));
    }

    #[test]
    fn test_user_data_invalidates_profile_and_settings() {
        let (manager, _, query) = setup();
        manager.invalidate_user_data();
        assert_eq!(
            query.invalidated(),
            vec![QueryKey::profile_detail(), QueryKey::profile_settings()]
        );
    }

    #[test]
    fn test_on_post_liked() {
        let (manager, cache, query) = setup();
        cache.set("community:post:p1", &1, ttl(), None);
        cache.set("community:stats", &2, ttl(), None);
        cache.set("community:feed", &3, ttl(), None);
        cache.set("community:comments:p1", &4, ttl(), None);

        manager.on_post_liked("p1");

        assert!(cache.get::<i32>("community:post:p1", None).is_none());
        assert!(cache.get::<i32>("community:stats", None).is_none());
        assert!(cache.get::<i32>("community:feed", None).is_none());
        assert_eq!(cache.get::<i32>("community:comments:p1", None), Some(4));
        assert_eq!(
            query.invalidated(),
            vec![QueryKey::community_post("p1"), QueryKey::community_feed()]
        );
    }

    #[test]
    fn test_handle_returns_removed_count() {
        let (manager, cache, _) = setup();
        manager.set_user_id("u1");
        cache.set("sadhanas:progress:s1", &1, ttl(), Some("u1"));
        cache.set("analytics:userProgress", &2, ttl(), Some("u1"));

        let removed = manager.handle(&DomainEvent::SadhanaProgressUpdated {
            sadhana_id: "s1".to_string(),
        });
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_clear_user_cache() {
        let (manager, cache, query) = setup();
        manager.set_user_id("u1");
        cache.set("books:1", &1, ttl(), Some("u1"));
        cache.set("books:1", &2, ttl(), Some("u2"));

        manager.clear_user_cache();

        assert!(cache.get::<i32>("books:1", Some("u1")).is_none());
        assert_eq!(cache.get::<i32>("books:1", Some("u2")), Some(2));
        assert_eq!(query.clears(), 1);
    }

    #[test]
    fn test_clear_user_cache_without_user_only_clears_queries() {
        let (manager, cache, query) = setup();
        cache.set("books:1", &1, ttl(), None);

        manager.clear_user_cache();

        assert_eq!(cache.get::<i32>("books:1", None), Some(1));
        assert_eq!(query.clears(), 1);
    }

    #[test]
    fn test_clear_all() {
        let (manager, cache, query) = setup();
        cache.set("books:1", &1, ttl(), Some("u1"));
        cache.set("books:list", &2, ttl(), None);

        manager.clear_all();

        assert_eq!(manager.get_cache_stats().item_count, 0);
        assert!(cache.persistent_keys().is_empty());
        assert_eq!(query.clears(), 1);
    }

    #[test]
    fn test_user_id_lifecycle() {
        let (manager, _, _) = setup();
        assert_eq!(manager.user_id(), None);

        manager.set_user_id("u1");
        assert_eq!(manager.user_id().as_deref(), Some("u1"));

        manager.set_user_id("u2");
        assert_eq!(manager.user_id().as_deref(), Some("u2"));

        manager.clear_user_id();
        assert_eq!(manager.user_id(), None);
    }

    #[test]
    fn test_user_id_survives_poisoned_lock() {
        let (manager, cache, _) = setup();
        manager.set_user_id("u1");
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = rw_write(&manager.user_id, "test.poison");
                panic!("panic while holding the user id");
            })
            .join()
        });

        assert_eq!(manager.user_id().as_deref(), Some("u1"));
        cache.set("profile:detail", &1, ttl(), Some("u1"));
        manager.invalidate_profile();
        assert!(cache.get::<i32>("profile:detail", Some("u1")).is_none());

        manager.clear_user_id();
        assert_eq!(manager.user_id(), None);
    }
}
