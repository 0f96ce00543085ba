use std::path::{Path, PathBuf};

use anyhow::Result;
use linkvote_core::{
    build_threads, Comment, CommentId, CommentThread, LedgerError, LinkDraft, LinkId, LinkPage,
    LinkSummary, Stance, User, UserId, Vote, VoteKind, VoteTally, VoteTransition,
};
use linkvote_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupResult {
    pub path: String,
    pub schema_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateUserRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub kind: VoteKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCommentRequest {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateCommentRequest {
    pub content: String,
}

/// Outcome of one cast, with the score and stance read back after commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteReceipt {
    pub link_id: LinkId,
    pub transition: VoteTransition,
    pub net_score: i64,
    pub user_vote: Stance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserVoteView {
    pub user_id: UserId,
    pub link_id: LinkId,
    pub stance: Stance,
    pub vote: Option<Vote>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkDetail {
    pub link: LinkSummary,
    pub threads: Vec<CommentThread>,
    pub viewer_stance: Stance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkDeleted {
    pub link_id: LinkId,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentDeleted {
    pub comment_id: CommentId,
    pub deleted: bool,
}

/// Domain failure carried inside an API error, if there is one.
#[must_use]
pub fn ledger_error(err: &anyhow::Error) -> Option<&LedgerError> {
    err.downcast_ref::<LedgerError>()
}

#[derive(Debug, Clone)]
pub struct LinkVoteApi {
    db_path: PathBuf,
}

impl LinkVoteApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Copy the migrated database to `out`.
    ///
    /// # Errors
    /// Returns an error when migration or the backup itself fails.
    pub fn backup(&self, out: &Path) -> Result<BackupResult> {
        let store = self.open_migrated_store()?;
        store.backup_database(out)?;
        Ok(BackupResult {
            path: out.display().to_string(),
            schema_version: store.schema_status()?.current_version,
        })
    }

    /// Replace the database contents with a backup, then migrate it.
    ///
    /// # Errors
    /// Returns an error when the backup is missing or the restore fails.
    pub fn restore(&self, input: &Path) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.restore_database(input)?;
        store.schema_status()
    }

    /// # Errors
    /// Returns `Validation` or `Conflict` inside the error for bad or taken names.
    pub fn create_user(&self, input: &CreateUserRequest) -> Result<User> {
        let mut store = self.open_migrated_store()?;
        store.create_user(&input.name)
    }

    /// # Errors
    /// Returns `NotFound` inside the error for an unknown user.
    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        let store = self.open_migrated_store()?;
        store.get_user(user_id)
    }

    /// Submit a link and return it with its (empty) counts.
    ///
    /// # Errors
    /// Returns `Validation` or `NotFound` inside the error, or a storage error.
    pub fn create_link(&self, actor: UserId, draft: &LinkDraft) -> Result<LinkSummary> {
        let mut store = self.open_migrated_store()?;
        let link = store.create_link(actor, draft)?;
        store.link_summary(link.link_id)
    }

    /// # Errors
    /// Returns `Validation`, `NotFound`, or `Forbidden` inside the error.
    pub fn update_link(
        &self,
        actor: UserId,
        link_id: LinkId,
        draft: &LinkDraft,
    ) -> Result<LinkSummary> {
        let mut store = self.open_migrated_store()?;
        store.update_link(actor, link_id, draft)?;
        store.link_summary(link_id)
    }

    /// # Errors
    /// Returns `NotFound` or `Forbidden` inside the error.
    pub fn delete_link(&self, actor: UserId, link_id: LinkId) -> Result<LinkDeleted> {
        let mut store = self.open_migrated_store()?;
        store.delete_link(actor, link_id)?;
        Ok(LinkDeleted { link_id, deleted: true })
    }

    /// # Errors
    /// Returns `Validation` inside the error for page `0`.
    pub fn list_links(&self, page: u32) -> Result<LinkPage> {
        let store = self.open_migrated_store()?;
        store.list_links(page)
    }

    /// Link summary, threaded comments, and the viewer's stance (`none` when anonymous).
    ///
    /// # Errors
    /// Returns `NotFound` inside the error for an unknown link.
    pub fn link_detail(&self, link_id: LinkId, viewer: Option<UserId>) -> Result<LinkDetail> {
        let store = self.open_migrated_store()?;
        let link = store.link_summary(link_id)?;
        let comments = store.list_comments(link_id)?;
        let viewer_stance = match viewer {
            Some(user_id) => store.user_vote(user_id, link_id)?,
            None => Stance::None,
        };
        Ok(LinkDetail { link, threads: build_threads(&comments), viewer_stance })
    }

    /// # Errors
    /// Returns `Validation` or `NotFound` inside the error.
    pub fn add_comment(
        &self,
        actor: UserId,
        link_id: LinkId,
        input: &AddCommentRequest,
    ) -> Result<Comment> {
        let mut store = self.open_migrated_store()?;
        store.add_comment(actor, link_id, &input.content, input.parent_id)
    }

    /// # Errors
    /// Returns `Validation`, `NotFound`, or `Forbidden` inside the error.
    pub fn update_comment(
        &self,
        actor: UserId,
        comment_id: CommentId,
        input: &UpdateCommentRequest,
    ) -> Result<Comment> {
        let mut store = self.open_migrated_store()?;
        store.update_comment(actor, comment_id, &input.content)
    }

    /// # Errors
    /// Returns `NotFound` or `Forbidden` inside the error.
    pub fn delete_comment(&self, actor: UserId, comment_id: CommentId) -> Result<CommentDeleted> {
        let mut store = self.open_migrated_store()?;
        store.delete_comment(actor, comment_id)?;
        Ok(CommentDeleted { comment_id, deleted: true })
    }

    /// Cast a vote and read back the committed score and stance.
    ///
    /// # Errors
    /// Returns `NotFound` or `ConstraintViolation` inside the error, or a storage error.
    pub fn vote(&self, actor: UserId, link_id: LinkId, input: &VoteRequest) -> Result<VoteReceipt> {
        let mut store = self.open_migrated_store()?;
        let transition = store.cast_vote(actor, link_id, input.kind)?;
        Ok(VoteReceipt {
            link_id,
            transition,
            net_score: store.net_score(link_id)?,
            user_vote: store.user_vote(actor, link_id)?,
        })
    }

    /// # Errors
    /// Returns `NotFound` inside the error for an unknown link.
    pub fn score(&self, link_id: LinkId) -> Result<VoteTally> {
        let store = self.open_migrated_store()?;
        store.tally(link_id)
    }

    /// # Errors
    /// Returns a storage error when the vote row cannot be read.
    pub fn user_vote(&self, user_id: UserId, link_id: LinkId) -> Result<UserVoteView> {
        let store = self.open_migrated_store()?;
        let vote = store.get_vote(user_id, link_id)?;
        let stance = Stance::from(vote.as_ref().map(|vote| vote.kind));
        Ok(UserVoteView { user_id, link_id, stance, vote })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("linkvote-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn fixture_draft() -> LinkDraft {
        LinkDraft {
            title: "Announcing Rust 1.78".to_string(),
            url: "https://blog.rust-lang.org/2024/05/02/Rust-1.78.0.html".to_string(),
            description: None,
        }
    }

    #[test]
    fn vote_receipt_tracks_record_flip_and_retract() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = LinkVoteApi::new(db_path.clone());
        let user = api.create_user(&CreateUserRequest { name: "ada".to_string() })?;
        let link = api.create_link(user.user_id, &fixture_draft())?;
        let link_id = link.link.link_id;

        let up = api.vote(user.user_id, link_id, &VoteRequest { kind: VoteKind::Up })?;
        assert_eq!(up.transition, VoteTransition::Recorded);
        assert_eq!((up.net_score, up.user_vote), (1, Stance::Up));

        let down = api.vote(user.user_id, link_id, &VoteRequest { kind: VoteKind::Down })?;
        assert_eq!(down.transition, VoteTransition::Flipped);
        assert_eq!((down.net_score, down.user_vote), (-1, Stance::Down));

        let again = api.vote(user.user_id, link_id, &VoteRequest { kind: VoteKind::Down })?;
        assert_eq!(again.transition, VoteTransition::Retracted);
        assert_eq!((again.net_score, again.user_vote), (0, Stance::None));

        assert_eq!(api.score(link_id)?, VoteTally::default());
        let cleared = api.user_vote(user.user_id, link_id)?;
        assert_eq!((cleared.stance, cleared.vote), (Stance::None, None));
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn link_detail_threads_comments_and_reports_viewer_stance() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = LinkVoteApi::new(db_path.clone());
        let author = api.create_user(&CreateUserRequest { name: "author".to_string() })?;
        let viewer = api.create_user(&CreateUserRequest { name: "viewer".to_string() })?;
        let link_id = api.create_link(author.user_id, &fixture_draft())?.link.link_id;

        let top = api.add_comment(
            author.user_id,
            link_id,
            &AddCommentRequest { content: "first".to_string(), parent_id: None },
        )?;
        api.add_comment(
            viewer.user_id,
            link_id,
            &AddCommentRequest { content: "reply".to_string(), parent_id: Some(top.comment_id) },
        )?;
        api.vote(viewer.user_id, link_id, &VoteRequest { kind: VoteKind::Down })?;

        let detail = api.link_detail(link_id, Some(viewer.user_id))?;
        assert_eq!(detail.viewer_stance, Stance::Down);
        assert_eq!(detail.link.comments_count, 2);
        assert_eq!(detail.link.tally.net_score, -1);
        assert_eq!(detail.threads.len(), 1);
        assert_eq!(detail.threads[0].replies.len(), 1);
        assert_eq!(detail.link.submitter_name, "author");
        assert_eq!(detail.threads[0].comment.author_name, "author");
        assert_eq!(detail.threads[0].replies[0].author_name, "viewer");

        let view = api.user_vote(viewer.user_id, link_id)?;
        assert_eq!(view.stance, Stance::Down);
        assert_eq!(view.vote.map(|vote| vote.kind), Some(VoteKind::Down));

        let anonymous = api.link_detail(link_id, None)?;
        assert_eq!(anonymous.viewer_stance, Stance::None);
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn domain_errors_survive_the_api_boundary() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = LinkVoteApi::new(db_path.clone());
        let owner = api.create_user(&CreateUserRequest { name: "owner".to_string() })?;
        let other = api.create_user(&CreateUserRequest { name: "other".to_string() })?;
        let link_id = api.create_link(owner.user_id, &fixture_draft())?.link.link_id;

        let Err(err) = api.delete_link(other.user_id, link_id) else {
            panic!("non-owner delete should fail");
        };
        assert_eq!(ledger_error(&err).map(LedgerError::code), Some("forbidden"));

        let Err(err) = api.vote(owner.user_id, LinkId::new(), &VoteRequest { kind: VoteKind::Up })
        else {
            panic!("vote on unknown link should fail");
        };
        assert_eq!(ledger_error(&err).map(LedgerError::code), Some("not_found"));

        let Err(err) = api.create_user(&CreateUserRequest { name: "owner".to_string() }) else {
            panic!("duplicate user should fail");
        };
        assert_eq!(ledger_error(&err).map(LedgerError::code), Some("conflict"));

        let deleted = api.delete_link(owner.user_id, link_id)?;
        assert!(deleted.deleted);
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = LinkVoteApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!(plan.current_version, 0);
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(applied.target_version));
        assert_eq!(applied.up_to_date, Some(true));
        cleanup(&db_path);
        Ok(())
    }
}
