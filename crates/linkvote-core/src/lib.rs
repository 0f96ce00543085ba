use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const LINKS_PER_PAGE: u32 = 10;
pub const MAX_USER_NAME_CHARS: usize = 64;
pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_URL_CHARS: usize = 255;
pub const MAX_DESCRIPTION_CHARS: usize = 1000;
pub const MAX_COMMENT_CHARS: usize = 1000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl LedgerError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Stable machine-readable code for wire envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::ConstraintViolation(_) => "constraint_violation",
        }
    }
}

macro_rules! ulid_id {
    ($name:ident, $entity:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`LedgerError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, LedgerError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    LedgerError::Validation(format!("invalid {} id `{raw}`: {err}", $entity))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

ulid_id!(UserId, "user");
ulid_id!(LinkId, "link");
ulid_id!(CommentId, "comment");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    Up,
    Down,
}

impl VoteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    /// Contribution of one vote of this kind to a net score.
    #[must_use]
    pub fn weight(self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }
}

/// A user's current position on a link, including having no vote at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Up,
    Down,
    #[default]
    None,
}

impl Stance {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn kind(self) -> Option<VoteKind> {
        match self {
            Self::Up => Some(VoteKind::Up),
            Self::Down => Some(VoteKind::Down),
            Self::None => None,
        }
    }
}

impl From<Option<VoteKind>> for Stance {
    fn from(value: Option<VoteKind>) -> Self {
        match value {
            Some(VoteKind::Up) => Self::Up,
            Some(VoteKind::Down) => Self::Down,
            None => Self::None,
        }
    }
}

/// What a cast did to the (user, link) row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoteTransition {
    /// No row existed; one was inserted.
    Recorded,
    /// A row of the same kind existed; it was deleted.
    Retracted,
    /// A row of the other kind existed; its kind was switched in place.
    Flipped,
}

impl VoteTransition {
    /// Decide the row mutation for a cast of `requested` given the row currently stored.
    #[must_use]
    pub fn decide(existing: Option<VoteKind>, requested: VoteKind) -> Self {
        match existing {
            None => Self::Recorded,
            Some(current) if current == requested => Self::Retracted,
            Some(_) => Self::Flipped,
        }
    }

    /// The stance left behind once this transition for `requested` has been applied.
    #[must_use]
    pub fn resulting_stance(self, requested: VoteKind) -> Stance {
        match self {
            Self::Recorded | Self::Flipped => Stance::from(Some(requested)),
            Self::Retracted => Stance::None,
        }
    }

    /// Net score change caused by this transition for `requested`.
    #[must_use]
    pub fn score_delta(self, requested: VoteKind) -> i64 {
        match self {
            Self::Recorded => requested.weight(),
            Self::Retracted => -requested.weight(),
            Self::Flipped => 2 * requested.weight(),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::Retracted => "retracted",
            Self::Flipped => "flipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct VoteTally {
    pub upvotes: i64,
    pub downvotes: i64,
    pub net_score: i64,
}

impl VoteTally {
    #[must_use]
    pub fn from_counts(upvotes: i64, downvotes: i64) -> Self {
        Self { upvotes, downvotes, net_score: upvotes - downvotes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub user_id: UserId,
    pub link_id: LinkId,
    pub kind: VoteKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Validate and normalize a display name.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the trimmed name is empty or too long.
pub fn normalize_user_name(raw: &str) -> Result<String, LedgerError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(LedgerError::Validation("name MUST be non-empty".to_string()));
    }
    if name.chars().count() > MAX_USER_NAME_CHARS {
        return Err(LedgerError::Validation(format!(
            "name MUST be at most {MAX_USER_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Link {
    pub link_id: LinkId,
    pub user_id: UserId,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// User-supplied link fields, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkDraft {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl LinkDraft {
    /// Validate title, URL and description and return a trimmed copy.
    /// A blank description collapses to `None`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] naming the first field that fails.
    pub fn normalize(&self) -> Result<Self, LedgerError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(LedgerError::Validation("title MUST be non-empty".to_string()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(LedgerError::Validation(format!(
                "title MUST be at most {MAX_TITLE_CHARS} characters"
            )));
        }

        let url = self.url.trim();
        if url.chars().count() > MAX_URL_CHARS {
            return Err(LedgerError::Validation(format!(
                "url MUST be at most {MAX_URL_CHARS} characters"
            )));
        }
        let parsed = url::Url::parse(url)
            .map_err(|err| LedgerError::Validation(format!("url MUST be absolute: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(LedgerError::Validation(
                "url MUST be an http(s) URL with a host".to_string(),
            ));
        }

        let description = match self.description.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) if text.chars().count() > MAX_DESCRIPTION_CHARS => {
                return Err(LedgerError::Validation(format!(
                    "description MUST be at most {MAX_DESCRIPTION_CHARS} characters"
                )));
            }
            Some(text) => Some(text.to_string()),
        };

        Ok(Self { title: title.to_string(), url: url.to_string(), description })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkSummary {
    #[serde(flatten)]
    pub link: Link,
    pub submitter_name: String,
    #[serde(flatten)]
    pub tally: VoteTally,
    pub comments_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkPage {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub items: Vec<LinkSummary>,
}

/// Row offset for a 1-based page number.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for page `0`.
pub fn page_offset(page: u32) -> Result<i64, LedgerError> {
    if page == 0 {
        return Err(LedgerError::Validation("page MUST be >= 1".to_string()));
    }
    Ok((i64::from(page) - 1) * i64::from(LINKS_PER_PAGE))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub comment_id: CommentId,
    pub link_id: LinkId,
    pub user_id: UserId,
    pub parent_id: Option<CommentId>,
    pub author_name: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Validate and trim comment text.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the content is blank or too long.
pub fn normalize_comment_content(raw: &str) -> Result<String, LedgerError> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(LedgerError::Validation("content MUST be non-empty".to_string()));
    }
    if content.chars().count() > MAX_COMMENT_CHARS {
        return Err(LedgerError::Validation(format!(
            "content MUST be at most {MAX_COMMENT_CHARS} characters"
        )));
    }
    Ok(content.to_string())
}

/// Check that `parent` may receive a reply on `link_id`.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the parent sits on another link or is
/// itself a reply.
pub fn check_reply_parent(parent: &Comment, link_id: LinkId) -> Result<(), LedgerError> {
    if parent.link_id != link_id {
        return Err(LedgerError::Validation(format!(
            "parent comment {} belongs to a different link",
            parent.comment_id
        )));
    }
    if parent.parent_id.is_some() {
        return Err(LedgerError::Validation(format!(
            "comment {} is a reply; replies cannot be nested",
            parent.comment_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: Vec<Comment>,
}

fn newest_first(a: &Comment, b: &Comment) -> Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| b.comment_id.cmp(&a.comment_id))
}

fn oldest_first(a: &Comment, b: &Comment) -> Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.comment_id.cmp(&b.comment_id))
}

/// Group a link's comments into top-level threads.
///
/// Threads are newest first; replies inside a thread are oldest first. Replies whose
/// parent is not a top-level comment in `comments` are dropped.
#[must_use]
pub fn build_threads(comments: &[Comment]) -> Vec<CommentThread> {
    let mut replies_by_parent: BTreeMap<CommentId, Vec<Comment>> = BTreeMap::new();
    let mut top_level = Vec::new();

    for comment in comments {
        match comment.parent_id {
            Some(parent_id) => {
                replies_by_parent.entry(parent_id).or_default().push(comment.clone());
            }
            None => top_level.push(comment.clone()),
        }
    }

    top_level.sort_by(newest_first);
    top_level
        .into_iter()
        .map(|comment| {
            let mut replies = replies_by_parent.remove(&comment.comment_id).unwrap_or_default();
            replies.sort_by(oldest_first);
            CommentThread { comment, replies }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time(offset_seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_seconds)
    }

    fn mk_comment(link_id: LinkId, parent_id: Option<CommentId>, at: i64) -> Comment {
        Comment {
            comment_id: CommentId::new(),
            link_id,
            user_id: UserId::new(),
            parent_id,
            author_name: "fixture".to_string(),
            content: format!("comment at {at}"),
            created_at: fixture_time(at),
            updated_at: fixture_time(at),
        }
    }

    fn vote_kind() -> impl Strategy<Value = VoteKind> {
        prop_oneof![Just(VoteKind::Up), Just(VoteKind::Down)]
    }

    fn cast_sequence() -> impl Strategy<Value = Vec<VoteKind>> {
        proptest::collection::vec(vote_kind(), 0..40)
    }

    #[test]
    fn decide_covers_the_three_branches() {
        assert_eq!(VoteTransition::decide(None, VoteKind::Up), VoteTransition::Recorded);
        assert_eq!(
            VoteTransition::decide(Some(VoteKind::Up), VoteKind::Up),
            VoteTransition::Retracted
        );
        assert_eq!(
            VoteTransition::decide(Some(VoteKind::Down), VoteKind::Up),
            VoteTransition::Flipped
        );
        assert_eq!(
            VoteTransition::decide(Some(VoteKind::Up), VoteKind::Down),
            VoteTransition::Flipped
        );
    }

    #[test]
    fn flip_moves_score_by_two() {
        let delta = VoteTransition::Flipped.score_delta(VoteKind::Down);
        assert_eq!(delta, -2);
        assert_eq!(VoteTransition::Flipped.resulting_stance(VoteKind::Down), Stance::Down);
    }

    #[test]
    fn stance_round_trips_through_option() {
        for stance in [Stance::Up, Stance::Down, Stance::None] {
            assert_eq!(Stance::from(stance.kind()), stance);
        }
        assert_eq!(Stance::Up.as_str(), "up");
        assert_eq!(Stance::None.as_str(), "none");
        assert_eq!(Stance::default(), Stance::None);
    }

    #[test]
    fn vote_kind_parse_rejects_legacy_names() {
        assert_eq!(VoteKind::parse("up"), Some(VoteKind::Up));
        assert_eq!(VoteKind::parse("down"), Some(VoteKind::Down));
        assert_eq!(VoteKind::parse("upvote"), None);
    }

    #[test]
    fn tally_from_counts_derives_net_score() {
        let tally = VoteTally::from_counts(2, 1);
        assert_eq!(tally.net_score, 1);
        assert_eq!(VoteTally::default().net_score, 0);
    }

    #[test]
    fn link_draft_normalizes_and_validates() {
        let draft = LinkDraft {
            title: "  Rust 2024  ".to_string(),
            url: " https://blog.rust-lang.org/ ".to_string(),
            description: Some("   ".to_string()),
        };
        let normalized = match draft.normalize() {
            Ok(value) => value,
            Err(err) => panic!("draft should validate: {err}"),
        };
        assert_eq!(normalized.title, "Rust 2024");
        assert_eq!(normalized.url, "https://blog.rust-lang.org/");
        assert_eq!(normalized.description, None);

        let bad_scheme = LinkDraft { url: "ftp://example.com/x".to_string(), ..draft.clone() };
        assert!(matches!(bad_scheme.normalize(), Err(LedgerError::Validation(_))));

        let relative = LinkDraft { url: "/relative".to_string(), ..draft.clone() };
        assert!(matches!(relative.normalize(), Err(LedgerError::Validation(_))));

        let long_title = LinkDraft { title: "t".repeat(MAX_TITLE_CHARS + 1), ..draft.clone() };
        assert!(matches!(long_title.normalize(), Err(LedgerError::Validation(_))));

        let long_description = LinkDraft {
            description: Some("d".repeat(MAX_DESCRIPTION_CHARS + 1)),
            ..draft
        };
        assert!(matches!(long_description.normalize(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn comment_content_limits() {
        assert!(normalize_comment_content("   ").is_err());
        assert!(normalize_comment_content(&"c".repeat(MAX_COMMENT_CHARS)).is_ok());
        assert!(normalize_comment_content(&"c".repeat(MAX_COMMENT_CHARS + 1)).is_err());
    }

    #[test]
    fn user_name_limits() {
        assert_eq!(normalize_user_name("  ada ").ok().as_deref(), Some("ada"));
        assert!(normalize_user_name("").is_err());
        assert!(normalize_user_name(&"n".repeat(MAX_USER_NAME_CHARS + 1)).is_err());
    }

    #[test]
    fn page_offset_is_one_based() {
        assert_eq!(page_offset(1).ok(), Some(0));
        assert_eq!(page_offset(3).ok(), Some(20));
        assert!(page_offset(0).is_err());
    }

    #[test]
    fn ids_parse_and_reject_garbage() {
        let id = LinkId::new();
        assert_eq!(LinkId::parse(&id.to_string()).ok(), Some(id));
        let Err(err) = UserId::parse("not-a-ulid") else {
            panic!("garbage should not parse as a user id");
        };
        assert!(err.to_string().contains("invalid user id"));
    }

    #[test]
    fn reply_parent_must_be_top_level_on_same_link() {
        let link_id = LinkId::new();
        let top = mk_comment(link_id, None, 0);
        let reply = mk_comment(link_id, Some(top.comment_id), 1);

        assert!(check_reply_parent(&top, link_id).is_ok());
        assert!(check_reply_parent(&reply, link_id).is_err());
        assert!(check_reply_parent(&top, LinkId::new()).is_err());
    }

    #[test]
    fn threads_order_top_level_newest_first_and_replies_oldest_first() {
        let link_id = LinkId::new();
        let older = mk_comment(link_id, None, 0);
        let newer = mk_comment(link_id, None, 10);
        let late_reply = mk_comment(link_id, Some(older.comment_id), 30);
        let early_reply = mk_comment(link_id, Some(older.comment_id), 20);
        let orphan = mk_comment(link_id, Some(CommentId::new()), 40);

        let threads = build_threads(&[
            late_reply.clone(),
            older.clone(),
            orphan,
            newer.clone(),
            early_reply.clone(),
        ]);

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].comment.comment_id, newer.comment_id);
        assert!(threads[0].replies.is_empty());
        assert_eq!(threads[1].comment.comment_id, older.comment_id);
        assert_eq!(
            threads[1].replies.iter().map(|c| c.comment_id).collect::<Vec<_>>(),
            vec![early_reply.comment_id, late_reply.comment_id]
        );
    }

    #[test]
    fn link_summary_serializes_flat() {
        let summary = LinkSummary {
            link: Link {
                link_id: LinkId::new(),
                user_id: UserId::new(),
                title: "title".to_string(),
                url: "https://example.com".to_string(),
                description: None,
                created_at: fixture_time(0),
                updated_at: fixture_time(0),
            },
            submitter_name: "ada".to_string(),
            tally: VoteTally::from_counts(3, 1),
            comments_count: 4,
        };
        let value = match serde_json::to_value(&summary) {
            Ok(value) => value,
            Err(err) => panic!("summary should serialize: {err}"),
        };
        assert_eq!(value.get("net_score").and_then(serde_json::Value::as_i64), Some(2));
        assert_eq!(value.get("title").and_then(serde_json::Value::as_str), Some("title"));
        assert_eq!(value.get("comments_count").and_then(serde_json::Value::as_i64), Some(4));
        assert_eq!(value.get("submitter_name").and_then(serde_json::Value::as_str), Some("ada"));
    }

    proptest! {
        #[test]
        fn replaying_casts_matches_a_model_ledger(casts in cast_sequence()) {
            let mut stored: Option<VoteKind> = None;
            let mut score = 0_i64;
            for requested in casts {
                let transition = VoteTransition::decide(stored, requested);
                score += transition.score_delta(requested);
                stored = transition.resulting_stance(requested).kind();
                let expected = stored.map_or(0, VoteKind::weight);
                prop_assert_eq!(score, expected);
            }
        }

        #[test]
        fn casting_twice_restores_the_prior_stance(requested in vote_kind()) {
            let first = VoteTransition::decide(None, requested);
            let stored = first.resulting_stance(requested).kind();
            let second = VoteTransition::decide(stored, requested);
            prop_assert_eq!(second, VoteTransition::Retracted);
            prop_assert_eq!(first.score_delta(requested) + second.score_delta(requested), 0);
        }

        #[test]
        fn opposite_cast_always_flips(requested in vote_kind()) {
            prop_assert_eq!(
                VoteTransition::decide(Some(requested.opposite()), requested),
                VoteTransition::Flipped
            );
        }
    }
}
