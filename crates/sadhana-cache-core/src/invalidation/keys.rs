//! Structured query-layer keys.
//!
//! The UI's query layer identifies queries by a list of segments, and
//! invalidating a key invalidates every query whose key starts with it.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether invalidating `self` also invalidates `other`.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        other.0.starts_with(&self.0)
    }

    // ===== Books =====

    pub fn book_lists() -> Self {
        Self::new(["books", "list"])
    }

    pub fn book_detail(id: &str) -> Self {
        Self::new(["books", "detail", id])
    }

    // ===== Sadhanas =====

    pub fn sadhana_lists() -> Self {
        Self::new(["sadhanas", "list"])
    }

    pub fn sadhana_detail(id: &str) -> Self {
        Self::new(["sadhanas", "detail", id])
    }

    pub fn sadhana_progress(id: &str) -> Self {
        Self::new(["sadhanas", "progress", id])
    }

    // ===== Profile =====

    pub fn profile_detail() -> Self {
        Self::new(["profile", "detail"])
    }

    pub fn profile_settings() -> Self {
        Self::new(["profile", "settings"])
    }

    // ===== Community =====

    pub fn community_feed() -> Self {
        Self::new(["community", "feed"])
    }

    pub fn community_post(id: &str) -> Self {
        Self::new(["community", "posts", id])
    }

    pub fn post_comments(id: &str) -> Self {
        Self::new(["community", "comments", id])
    }

    // ===== Analytics =====

    pub fn analytics() -> Self {
        Self::new(["analytics"])
    }

    pub fn user_progress() -> Self {
        Self::new(["analytics", "userProgress"])
    }

    pub fn practice_trends() -> Self {
        Self::new(["analytics", "practiceTrends"])
    }

    pub fn completion_rates() -> Self {
        Self::new(["analytics", "completionRates"])
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching() {
        let lists = QueryKey::book_lists();
        let filtered = QueryKey::new(["books", "list", "{\"language\":\"sa\"}"]);

        assert!(lists.is_prefix_of(&filtered));
        assert!(lists.is_prefix_of(&lists));
        assert!(!filtered.is_prefix_of(&lists));
        assert!(!lists.is_prefix_of(&QueryKey::book_detail("1")));
    }

    #[test]
    fn test_analytics_root_covers_children() {
        let root = QueryKey::analytics();
        assert!(root.is_prefix_of(&QueryKey::user_progress()));
        assert!(root.is_prefix_of(&QueryKey::new(["analytics", "practiceTrends", "week", "day"])));
        assert!(!root.is_prefix_of(&QueryKey::community_feed()));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            QueryKey::sadhana_progress("s42").to_string(),
            "[sadhanas, progress, s42]"
        );
    }
}
