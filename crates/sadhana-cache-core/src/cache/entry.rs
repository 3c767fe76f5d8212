use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Prefix shared by every persistent-tier key written by the cache.
pub const STORAGE_PREFIX: &str = "cache:";

/// A cached value together with its write time, TTL and owning scope.
///
/// Entries are never mutated in place; every write replaces the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "ttl_millis")]
    pub ttl: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, timestamp: DateTime<Utc>, ttl: Duration, scope: Option<String>) -> Self {
        Self {
            data,
            timestamp,
            ttl,
            scope,
        }
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Fresh while `now - timestamp < ttl`. A zero or negative TTL is never fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) < self.ttl
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_fresh_at(now)
    }

    pub fn age_display_at(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_at(now).num_minutes();
        if minutes < 1 {
            // Covers clock skew as well
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            timestamp: self.timestamp,
            ttl: self.ttl,
            scope: self.scope,
        }
    }
}

/// Persistent-tier key for `key` in `scope`: `cache:<scope>:<key>` or `cache:<key>`.
pub fn storage_key(key: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{}{}:{}", STORAGE_PREFIX, scope, key),
        None => format!("{}{}", STORAGE_PREFIX, key),
    }
}

/// Recover the caller-facing key from a storage key, given the scope the
/// entry was written under. Returns `None` if the storage key does not belong
/// to that scope.
pub fn unscoped_key<'a>(storage_key: &'a str, scope: Option<&str>) -> Option<&'a str> {
    let rest = storage_key.strip_prefix(STORAGE_PREFIX)?;
    match scope {
        Some(scope) => rest.strip_prefix(scope)?.strip_prefix(':'),
        None => Some(rest),
    }
}

mod ttl_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ttl.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        i64::deserialize(deserializer).map(Duration::milliseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(now: DateTime<Utc>, ttl_ms: i64) -> CacheEntry<u32> {
        CacheEntry::new(7, now, Duration::milliseconds(ttl_ms), None)
    }

    #[test]
    fn test_fresh_until_ttl_elapses() {
        let now = Utc::now();
        let entry = entry_at(now, 1000);

        assert!(entry.is_fresh_at(now));
        assert!(entry.is_fresh_at(now + Duration::milliseconds(999)));
        assert!(entry.is_stale_at(now + Duration::milliseconds(1000)));
    }

    #[test]
    fn test_zero_and_negative_ttl_are_stale() {
        let now = Utc::now();
        assert!(entry_at(now, 0).is_stale_at(now));
        assert!(entry_at(now, -50).is_stale_at(now));
    }

    #[test]
    fn test_age_display() {
        let now = Utc::now();
        let entry = entry_at(now, 1000);

        assert_eq!(entry.age_display_at(now), "just now");
        assert_eq!(entry.age_display_at(now - Duration::minutes(3)), "just now");
        assert_eq!(entry.age_display_at(now + Duration::minutes(5)), "5m ago");
        assert_eq!(entry.age_display_at(now + Duration::minutes(95)), "2h ago");
        assert_eq!(entry.age_display_at(now + Duration::minutes(70)), "1h ago");
        assert_eq!(entry.age_display_at(now + Duration::hours(40)), "2d ago");
    }

    #[test]
    fn test_serialized_shape() {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000)
            .expect("valid timestamp");
        let entry = CacheEntry::new("x", timestamp, Duration::minutes(5), Some("u1".to_string()));

        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(json["ttl"], 300_000);
        assert_eq!(json["scope"], "u1");

        let global = CacheEntry::new("x", timestamp, Duration::minutes(5), None);
        let json = serde_json::to_value(&global).expect("serialize");
        assert!(json.get("scope").is_none());
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(storage_key("books:1", None), "cache:books:1");
        assert_eq!(storage_key("books:1", Some("u1")), "cache:u1:books:1");
    }

    #[test]
    fn test_unscoped_key() {
        assert_eq!(unscoped_key("cache:u1:books:1", Some("u1")), Some("books:1"));
        assert_eq!(unscoped_key("cache:books:1", None), Some("books:1"));
        assert_eq!(unscoped_key("cache:u2:books:1", Some("u1")), None);
        assert_eq!(unscoped_key("cache:u10:books:1", Some("u1")), None);
        assert_eq!(unscoped_key("theme:books:1", None), None);
    }
}
