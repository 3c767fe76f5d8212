//! Resource invalidations and the domain events that trigger them.

use std::fmt;

use super::keys::QueryKey;
use crate::error::EventError;

/// A flat-key target in the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTarget {
    /// One exact key.
    Key(String),
    /// A glob over unscoped keys.
    Pattern(&'static str),
}

/// One invalidatable resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Books,
    Book(String),
    BookSearch,
    Sadhanas,
    Sadhana(String),
    SadhanaProgress(String),
    SadhanaStats,
    Profile,
    Settings,
    CommunityFeed,
    Post(String),
    PostComments(String),
    CommunityStats,
    Analytics,
    UserProgress,
    PracticeTrends,
    CompletionRates,
}

impl Invalidation {
    /// Query-layer key to invalidate, if the resource is mirrored there.
    pub fn query_key(&self) -> Option<QueryKey> {
        use Invalidation::*;

        let key = match self {
            Books | BookSearch => QueryKey::book_lists(),
            Book(id) => QueryKey::book_detail(id),
            Sadhanas => QueryKey::sadhana_lists(),
            Sadhana(id) => QueryKey::sadhana_detail(id),
            SadhanaProgress(id) => QueryKey::sadhana_progress(id),
            Profile => QueryKey::profile_detail(),
            Settings => QueryKey::profile_settings(),
            CommunityFeed => QueryKey::community_feed(),
            Post(id) => QueryKey::community_post(id),
            PostComments(id) => QueryKey::post_comments(id),
            Analytics => QueryKey::analytics(),
            UserProgress => QueryKey::user_progress(),
            PracticeTrends => QueryKey::practice_trends(),
            CompletionRates => QueryKey::completion_rates(),
            SadhanaStats | CommunityStats => return None,
        };
        Some(key)
    }

    /// Cache-store entries to remove.
    pub fn cache_targets(&self) -> Vec<CacheTarget> {
        use CacheTarget::{Key, Pattern};
        use Invalidation::*;

        match self {
            Books => vec![Pattern("books:*")],
            Book(id) => vec![Key(format!("books:{}", id))],
            BookSearch => vec![Pattern("books:search:*")],
            Sadhanas => vec![Pattern("sadhanas:*")],
            Sadhana(id) => vec![Key(format!("sadhanas:{}", id))],
            SadhanaProgress(id) => vec![Key(format!("sadhanas:progress:{}", id))],
            SadhanaStats => vec![Key("sadhanas:stats".to_string())],
            Profile => vec![Key("profile:detail".to_string())],
            Settings => vec![Key("profile:settings".to_string())],
            // The unparameterized feed lives at `community:feed` itself
            CommunityFeed => vec![
                Key("community:feed".to_string()),
                Pattern("community:feed:*"),
            ],
            Post(id) => vec![Key(format!("community:post:{}", id))],
            PostComments(id) => vec![Key(format!("community:comments:{}", id))],
            CommunityStats => vec![Key("community:stats".to_string())],
            Analytics => vec![Pattern("analytics:*")],
            UserProgress => vec![Key("analytics:userProgress".to_string())],
            PracticeTrends => vec![Pattern("analytics:trends:*")],
            CompletionRates => vec![Pattern("analytics:completion:*")],
        }
    }
}

// ============================================================================
// Domain events
// ============================================================================

/// A data change reported by the backend (realtime push or local mutation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    SadhanaCompleted { sadhana_id: String },
    SadhanaProgressUpdated { sadhana_id: String },
    NewPost,
    PostLiked { post_id: String },
    ProfileUpdated,
    UserActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    SadhanaCompleted,
    SadhanaProgressUpdated,
    NewPost,
    PostLiked,
    ProfileUpdated,
    UserActivity,
}

enum Rule {
    Fixed(Invalidation),
    /// Built from the event's subject id.
    ForSubject(fn(String) -> Invalidation),
}

// ===== Rule table =====

static SADHANA_COMPLETED: &[Rule] = &[
    Rule::ForSubject(Invalidation::Sadhana),
    Rule::Fixed(Invalidation::SadhanaStats),
    Rule::Fixed(Invalidation::UserProgress),
    Rule::Fixed(Invalidation::PracticeTrends),
];

static SADHANA_PROGRESS_UPDATED: &[Rule] = &[
    Rule::ForSubject(Invalidation::SadhanaProgress),
    Rule::Fixed(Invalidation::UserProgress),
];

static NEW_POST: &[Rule] = &[
    Rule::Fixed(Invalidation::CommunityFeed),
    Rule::Fixed(Invalidation::CommunityStats),
];

static POST_LIKED: &[Rule] = &[
    Rule::ForSubject(Invalidation::Post),
    Rule::Fixed(Invalidation::CommunityStats),
    Rule::Fixed(Invalidation::CommunityFeed),
];

static PROFILE_UPDATED: &[Rule] = &[Rule::Fixed(Invalidation::Profile)];

// Activity streams are embedded in the feed
static USER_ACTIVITY: &[Rule] = &[Rule::Fixed(Invalidation::CommunityFeed)];

impl EventKind {
    const ALL: [EventKind; 6] = [
        EventKind::SadhanaCompleted,
        EventKind::SadhanaProgressUpdated,
        EventKind::NewPost,
        EventKind::PostLiked,
        EventKind::ProfileUpdated,
        EventKind::UserActivity,
    ];

    fn name(self) -> &'static str {
        match self {
            EventKind::SadhanaCompleted => "sadhana_completed",
            EventKind::SadhanaProgressUpdated => "sadhana_progress_updated",
            EventKind::NewPost => "new_post",
            EventKind::PostLiked => "post_liked",
            EventKind::ProfileUpdated => "profile_updated",
            EventKind::UserActivity => "user_activity",
        }
    }

    fn takes_subject(self) -> bool {
        matches!(
            self,
            EventKind::SadhanaCompleted | EventKind::SadhanaProgressUpdated | EventKind::PostLiked
        )
    }

    fn rules(self) -> &'static [Rule] {
        match self {
            EventKind::SadhanaCompleted => SADHANA_COMPLETED,
            EventKind::SadhanaProgressUpdated => SADHANA_PROGRESS_UPDATED,
            EventKind::NewPost => NEW_POST,
            EventKind::PostLiked => POST_LIKED,
            EventKind::ProfileUpdated => PROFILE_UPDATED,
            EventKind::UserActivity => USER_ACTIVITY,
        }
    }
}

impl DomainEvent {
    /// Build an event from its textual name, e.g. `sadhana_completed`.
    pub fn parse(name: &str, subject: Option<&str>) -> Result<Self, EventError> {
        let kind = EventKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| EventError::Unknown(name.to_string()))?;

        let subject = match subject {
            Some(s) if !s.is_empty() => s.to_string(),
            _ if kind.takes_subject() => return Err(EventError::MissingSubject(kind.name())),
            _ => String::new(),
        };

        Ok(match kind {
            EventKind::SadhanaCompleted => Self::SadhanaCompleted { sadhana_id: subject },
            EventKind::SadhanaProgressUpdated => Self::SadhanaProgressUpdated { sadhana_id: subject },
            EventKind::NewPost => Self::NewPost,
            EventKind::PostLiked => Self::PostLiked { post_id: subject },
            EventKind::ProfileUpdated => Self::ProfileUpdated,
            EventKind::UserActivity => Self::UserActivity,
        })
    }

    fn kind(&self) -> EventKind {
        match self {
            Self::SadhanaCompleted { .. } => EventKind::SadhanaCompleted,
            Self::SadhanaProgressUpdated { .. } => EventKind::SadhanaProgressUpdated,
            Self::NewPost => EventKind::NewPost,
            Self::PostLiked { .. } => EventKind::PostLiked,
            Self::ProfileUpdated => EventKind::ProfileUpdated,
            Self::UserActivity => EventKind::UserActivity,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::SadhanaCompleted { sadhana_id } | Self::SadhanaProgressUpdated { sadhana_id } => {
                Some(sadhana_id)
            }
            Self::PostLiked { post_id } => Some(post_id),
            Self::NewPost | Self::ProfileUpdated | Self::UserActivity => None,
        }
    }

    /// Invalidations this event causes, in order.
    pub fn invalidations(&self) -> Vec<Invalidation> {
        let subject = self.subject().unwrap_or_default();
        self.kind()
            .rules()
            .iter()
            .map(|rule| match rule {
                Rule::Fixed(invalidation) => invalidation.clone(),
                Rule::ForSubject(build) => build(subject.to_string()),
            })
            .collect()
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Some(subject) => write!(f, "{}({})", self.name(), subject),
            None => f.write_str(self.name()),
        }
    }
}
