use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use linkvote_core::{
    check_reply_parent, normalize_comment_content, normalize_user_name, page_offset, Comment,
    CommentId, LedgerError, Link, LinkDraft, LinkId, LinkPage, LinkSummary, Stance, User, UserId,
    Vote, VoteKind, VoteTally, VoteTransition, LINKS_PER_PAGE,
};
use rusqlite::{params, Connection, DatabaseName, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS links (
  link_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  title TEXT NOT NULL,
  url TEXT NOT NULL,
  description TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS comments (
  comment_id TEXT PRIMARY KEY,
  link_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  parent_id TEXT,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (link_id) REFERENCES links(link_id) ON DELETE CASCADE,
  FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE,
  FOREIGN KEY (parent_id) REFERENCES comments(comment_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS votes (
  user_id TEXT NOT NULL,
  link_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('up','down')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(user_id, link_id),
  FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE,
  FOREIGN KEY (link_id) REFERENCES links(link_id) ON DELETE CASCADE
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_votes_link_kind ON votes(link_id, kind);
CREATE INDEX IF NOT EXISTS idx_comments_link ON comments(link_id, created_at);
CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_id);
CREATE INDEX IF NOT EXISTS idx_links_created_at ON links(created_at);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const LINK_SUMMARY_SELECT: &str = r"
SELECT
  l.link_id, l.user_id, l.title, l.url, l.description, l.created_at, l.updated_at,
  (SELECT COUNT(*) FROM votes v WHERE v.link_id = l.link_id AND v.kind = 'up'),
  (SELECT COUNT(*) FROM votes v WHERE v.link_id = l.link_id AND v.kind = 'down'),
  (SELECT COUNT(*) FROM comments c WHERE c.link_id = l.link_id),
  u.name
FROM links l
JOIN users u ON u.user_id = l.user_id
";

const COMMENT_SELECT: &str = r"
SELECT c.comment_id, c.link_id, c.user_id, c.parent_id, c.content, c.created_at, c.updated_at,
  u.name
FROM comments c
JOIN users u ON u.user_id = c.user_id
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub duplicate_vote_pairs: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed link store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect::<Vec<_>>();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or a migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        for (version, sql) in MIGRATIONS {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration transaction")?;
            if current_schema_version(&tx)? >= version {
                continue;
            }
            tx.execute_batch(sql)
                .with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            tracing::info!("applied schema migration v{}", version);
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Register a user under a unique display name.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a bad name, [`LedgerError::Conflict`] when the
    /// name is taken, or a storage error.
    pub fn create_user(&mut self, name: &str) -> Result<User> {
        let name = normalize_user_name(name)?;
        let user = User { user_id: UserId::new(), name, created_at: OffsetDateTime::now_utc() };
        let created_at = timestamp(user.created_at)?;

        self.conn
            .execute(
                "INSERT INTO users(user_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![user.user_id.to_string(), user.name, created_at],
            )
            .map_err(|err| {
                if is_unique_violation(&err) {
                    anyhow::Error::new(LedgerError::Conflict(format!(
                        "user name already taken: {}",
                        user.name
                    )))
                } else {
                    anyhow::Error::new(err).context("failed to insert user")
                }
            })?;

        Ok(user)
    }

    /// Load one user.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown user, or a storage error.
    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        load_user(&self.conn, user_id)
    }

    /// Submit a new link on behalf of `user_id`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for bad fields, [`LedgerError::NotFound`] for an
    /// unknown user, or a storage error.
    pub fn create_link(&mut self, user_id: UserId, draft: &LinkDraft) -> Result<Link> {
        let draft = draft.normalize()?;
        let now = OffsetDateTime::now_utc();
        let created_at = timestamp(now)?;
        let link = Link {
            link_id: LinkId::new(),
            user_id,
            title: draft.title,
            url: draft.url,
            description: draft.description,
            created_at: now,
            updated_at: now,
        };

        let tx = self.conn.transaction().context("failed to start transaction")?;
        ensure_user_exists(&tx, user_id)?;
        tx.execute(
            "INSERT INTO links(link_id, user_id, title, url, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                link.link_id.to_string(),
                link.user_id.to_string(),
                link.title,
                link.url,
                link.description,
                created_at,
            ],
        )
        .context("failed to insert link")?;
        tx.commit().context("failed to commit link transaction")?;

        tracing::info!("link {} submitted by {}", link.link_id, user_id);
        Ok(link)
    }

    /// Load one link together with its vote tally and comment count.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown link, or a storage error.
    pub fn link_summary(&self, link_id: LinkId) -> Result<LinkSummary> {
        query_one(
            &self.conn,
            &format!("{LINK_SUMMARY_SELECT} WHERE l.link_id = ?1"),
            params![link_id.to_string()],
            link_summary_from_row,
        )?
        .ok_or_else(|| LedgerError::not_found("link", link_id).into())
    }

    /// Newest links first, [`LINKS_PER_PAGE`] per page.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for page `0`, or a storage error.
    pub fn list_links(&self, page: u32) -> Result<LinkPage> {
        let offset = page_offset(page)?;
        let total = self
            .conn
            .query_row("SELECT COUNT(*) FROM links", [], |row| row.get::<_, i64>(0))
            .context("failed to count links")?;

        let mut stmt = self.conn.prepare(&format!(
            "{LINK_SUMMARY_SELECT} ORDER BY l.created_at DESC, l.rowid DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let mut rows = stmt.query(params![i64::from(LINKS_PER_PAGE), offset])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(link_summary_from_row(row)?);
        }

        Ok(LinkPage { page, per_page: LINKS_PER_PAGE, total, items })
    }

    /// Replace a link's editable fields. Only the submitter may edit.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`], [`LedgerError::NotFound`],
    /// [`LedgerError::Forbidden`], or a storage error.
    pub fn update_link(
        &mut self,
        actor: UserId,
        link_id: LinkId,
        draft: &LinkDraft,
    ) -> Result<Link> {
        let draft = draft.normalize()?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut link = load_link(&tx, link_id)?;
        ensure_owner(link.user_id, actor, "link", link_id)?;

        link.title = draft.title;
        link.url = draft.url;
        link.description = draft.description;
        link.updated_at = OffsetDateTime::now_utc();
        let updated_at = timestamp(link.updated_at)?;

        tx.execute(
            "UPDATE links SET title = ?2, url = ?3, description = ?4, updated_at = ?5
             WHERE link_id = ?1",
            params![link_id.to_string(), link.title, link.url, link.description, updated_at],
        )
        .context("failed to update link")?;
        tx.commit().context("failed to commit link update")?;
        Ok(link)
    }

    /// Delete a link with its votes and comments. Only the submitter may delete.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`], [`LedgerError::Forbidden`], or a storage error.
    pub fn delete_link(&mut self, actor: UserId, link_id: LinkId) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let link = load_link(&tx, link_id)?;
        ensure_owner(link.user_id, actor, "link", link_id)?;
        tx.execute("DELETE FROM links WHERE link_id = ?1", params![link_id.to_string()])
            .context("failed to delete link")?;
        tx.commit().context("failed to commit link delete")?;

        tracing::info!("link {} deleted by {}", link_id, actor);
        Ok(())
    }

    /// Add a top-level comment, or a reply when `parent_id` is set.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for bad content or an invalid parent,
    /// [`LedgerError::NotFound`] for an unknown user, link, or parent, or a storage error.
    pub fn add_comment(
        &mut self,
        user_id: UserId,
        link_id: LinkId,
        content: &str,
        parent_id: Option<CommentId>,
    ) -> Result<Comment> {
        let content = normalize_comment_content(content)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        ensure_user_exists(&tx, user_id)?;
        ensure_link_exists(&tx, link_id)?;
        if let Some(parent_id) = parent_id {
            let parent = load_comment(&tx, parent_id)?;
            check_reply_parent(&parent, link_id)?;
        }

        let comment_id = CommentId::new();
        tx.execute(
            "INSERT INTO comments(
               comment_id, link_id, user_id, parent_id, content, created_at, updated_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                comment_id.to_string(),
                link_id.to_string(),
                user_id.to_string(),
                parent_id.map(|id| id.to_string()),
                content,
                timestamp(OffsetDateTime::now_utc())?,
            ],
        )
        .context("failed to insert comment")?;
        let comment = load_comment(&tx, comment_id)?;
        tx.commit().context("failed to commit comment transaction")?;
        Ok(comment)
    }

    /// Load one comment.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown comment, or a storage error.
    pub fn get_comment(&self, comment_id: CommentId) -> Result<Comment> {
        load_comment(&self.conn, comment_id)
    }

    /// Replace a comment's text. Only the author may edit.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`], [`LedgerError::NotFound`],
    /// [`LedgerError::Forbidden`], or a storage error.
    pub fn update_comment(
        &mut self,
        actor: UserId,
        comment_id: CommentId,
        content: &str,
    ) -> Result<Comment> {
        let content = normalize_comment_content(content)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut comment = load_comment(&tx, comment_id)?;
        ensure_owner(comment.user_id, actor, "comment", comment_id)?;

        comment.content = content;
        comment.updated_at = OffsetDateTime::now_utc();
        tx.execute(
            "UPDATE comments SET content = ?2, updated_at = ?3 WHERE comment_id = ?1",
            params![comment_id.to_string(), comment.content, timestamp(comment.updated_at)?],
        )
        .context("failed to update comment")?;
        tx.commit().context("failed to commit comment update")?;
        Ok(comment)
    }

    /// Delete a comment and its replies. Only the author may delete.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`], [`LedgerError::Forbidden`], or a storage error.
    pub fn delete_comment(&mut self, actor: UserId, comment_id: CommentId) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let comment = load_comment(&tx, comment_id)?;
        ensure_owner(comment.user_id, actor, "comment", comment_id)?;
        tx.execute("DELETE FROM comments WHERE comment_id = ?1", params![comment_id.to_string()])
            .context("failed to delete comment")?;
        tx.commit().context("failed to commit comment delete")?;
        Ok(())
    }

    /// All comments on a link, oldest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown link, or a storage error.
    pub fn list_comments(&self, link_id: LinkId) -> Result<Vec<Comment>> {
        ensure_link_exists(&self.conn, link_id)?;
        let mut stmt = self.conn.prepare(&format!(
            "{COMMENT_SELECT} WHERE c.link_id = ?1 ORDER BY c.created_at ASC, c.rowid ASC"
        ))?;
        let mut rows = stmt.query(params![link_id.to_string()])?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next()? {
            comments.push(comment_from_row(row)?);
        }
        Ok(comments)
    }

    /// Cast `kind` for `(user_id, link_id)`: record a first vote, retract a repeated one,
    /// or flip an opposite one.
    ///
    /// The read and the write share one `BEGIN IMMEDIATE` transaction. If the uniqueness
    /// constraint still rejects the write, the cast is retried once against the committed
    /// row; a second rejection is returned as [`LedgerError::ConstraintViolation`].
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown user or link,
    /// [`LedgerError::ConstraintViolation`] when the retry also races, or a storage error.
    pub fn cast_vote(
        &mut self,
        user_id: UserId,
        link_id: LinkId,
        kind: VoteKind,
    ) -> Result<VoteTransition> {
        self.cast_vote_with(user_id, link_id, kind, |conn| read_vote_kind(conn, user_id, link_id))
    }

    fn cast_vote_with<F>(
        &mut self,
        user_id: UserId,
        link_id: LinkId,
        kind: VoteKind,
        observe: F,
    ) -> Result<VoteTransition>
    where
        F: FnOnce(&Connection) -> Result<Option<VoteKind>>,
    {
        let observed = {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start vote transaction")?;
            ensure_user_exists(&tx, user_id)?;
            ensure_link_exists(&tx, link_id)?;
            let observed = observe(&*tx)?;

            match apply_transition(&tx, user_id, link_id, observed, kind) {
                Ok(transition) => {
                    tx.commit().context("failed to commit vote transaction")?;
                    tracing::debug!(
                        "vote {} by {} on {}: {}, stance now {}",
                        kind.as_str(),
                        user_id,
                        link_id,
                        transition.as_str(),
                        transition.resulting_stance(kind).as_str()
                    );
                    return Ok(transition);
                }
                Err(err) if is_constraint_violation(&err) => observed,
                Err(err) => return Err(err),
            }
        };

        tracing::warn!(
            "vote by {} on {} raced a concurrent writer; retrying against committed row",
            user_id,
            link_id
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start vote retry transaction")?;
        let current = read_vote_kind(&tx, user_id, link_id)?;
        let intended = VoteTransition::decide(observed, kind);

        // The concurrent writer already produced the stance this caller asked for.
        let transition = if Stance::from(current) == intended.resulting_stance(kind) {
            intended
        } else {
            apply_transition(&tx, user_id, link_id, current, kind)?
        };
        tx.commit().context("failed to commit vote retry transaction")?;
        Ok(transition)
    }

    /// `count(up) - count(down)` for a link; `0` when nobody has voted.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown link, or a storage error.
    pub fn net_score(&self, link_id: LinkId) -> Result<i64> {
        ensure_link_exists(&self.conn, link_id)?;
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(CASE kind WHEN 'up' THEN 1 ELSE -1 END), 0)
                 FROM votes WHERE link_id = ?1",
                params![link_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to compute net score")
    }

    /// Up and down counts for a link, with the derived net score.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown link, or a storage error.
    pub fn tally(&self, link_id: LinkId) -> Result<VoteTally> {
        ensure_link_exists(&self.conn, link_id)?;
        let (upvotes, downvotes) = self
            .conn
            .query_row(
                "SELECT
                   COALESCE(SUM(CASE WHEN kind = 'up' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN kind = 'down' THEN 1 ELSE 0 END), 0)
                 FROM votes WHERE link_id = ?1",
                params![link_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("failed to tally votes")?;
        Ok(VoteTally::from_counts(upvotes, downvotes))
    }

    /// The user's current stance on a link.
    ///
    /// # Errors
    /// Returns a storage error when the vote row cannot be read.
    pub fn user_vote(&self, user_id: UserId, link_id: LinkId) -> Result<Stance> {
        read_vote_kind(&self.conn, user_id, link_id).map(Stance::from)
    }

    /// The stored vote row for `(user_id, link_id)`, if any.
    ///
    /// # Errors
    /// Returns a storage error when the vote row cannot be read.
    pub fn get_vote(&self, user_id: UserId, link_id: LinkId) -> Result<Option<Vote>> {
        query_one(
            &self.conn,
            "SELECT user_id, link_id, kind, created_at, updated_at
             FROM votes WHERE user_id = ?1 AND link_id = ?2",
            params![user_id.to_string(), link_id.to_string()],
            vote_from_row,
        )
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, vote uniqueness, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let duplicate_vote_pairs = if schema_status.current_version >= 1 {
            self.conn
                .query_row(
                    "SELECT COUNT(*) FROM (
                       SELECT 1 FROM votes GROUP BY user_id, link_id HAVING COUNT(*) > 1
                     )",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to check vote uniqueness")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            duplicate_vote_pairs,
            schema_status,
        })
    }
}

fn apply_transition(
    conn: &Connection,
    user_id: UserId,
    link_id: LinkId,
    existing: Option<VoteKind>,
    kind: VoteKind,
) -> Result<VoteTransition> {
    let transition = VoteTransition::decide(existing, kind);
    let now = timestamp(OffsetDateTime::now_utc())?;
    let user = user_id.to_string();
    let link = link_id.to_string();

    let written = match transition {
        VoteTransition::Recorded => conn.execute(
            "INSERT INTO votes(user_id, link_id, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user, link, kind.as_str(), now],
        ),
        VoteTransition::Retracted => conn.execute(
            "DELETE FROM votes WHERE user_id = ?1 AND link_id = ?2 AND kind = ?3",
            params![user, link, kind.as_str()],
        ),
        VoteTransition::Flipped => conn.execute(
            "UPDATE votes SET kind = ?3, updated_at = ?4
             WHERE user_id = ?1 AND link_id = ?2 AND kind = ?5",
            params![user, link, kind.as_str(), now, kind.opposite().as_str()],
        ),
    }
    .map_err(|err| {
        if is_unique_violation(&err) {
            anyhow::Error::new(LedgerError::ConstraintViolation(format!(
                "vote for user {user_id} on link {link_id} already exists"
            )))
        } else {
            anyhow::Error::new(err).context("failed to write vote")
        }
    })?;

    // Retract and flip match on the observed kind; zero rows means the row moved underneath.
    if written != 1 {
        return Err(LedgerError::ConstraintViolation(format!(
            "vote for user {user_id} on link {link_id} changed before {} could apply",
            transition.as_str()
        ))
        .into());
    }

    Ok(transition)
}

fn read_vote_kind(conn: &Connection, user_id: UserId, link_id: LinkId) -> Result<Option<VoteKind>> {
    query_one(
        conn,
        "SELECT kind FROM votes WHERE user_id = ?1 AND link_id = ?2",
        params![user_id.to_string(), link_id.to_string()],
        |row| parse_vote_kind(&row.get::<_, String>(0)?),
    )
}

fn parse_vote_kind(raw: &str) -> Result<VoteKind> {
    VoteKind::parse(raw).ok_or_else(|| anyhow!("unknown vote kind: {raw}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LedgerError>(), Some(LedgerError::ConstraintViolation(_)))
}

fn ensure_owner(
    owner: UserId,
    actor: UserId,
    entity: &str,
    id: impl std::fmt::Display,
) -> Result<()> {
    if owner != actor {
        return Err(LedgerError::Forbidden(format!("{entity} {id} belongs to another user")).into());
    }
    Ok(())
}

fn ensure_exists(
    conn: &Connection,
    table: &str,
    column: &str,
    entity: &'static str,
    id: String,
) -> Result<()> {
    let exists = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = ?1)"),
            params![id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to look up {entity} {id}"))?;
    if exists != 1 {
        return Err(LedgerError::NotFound { entity, id }.into());
    }
    Ok(())
}

fn ensure_user_exists(conn: &Connection, user_id: UserId) -> Result<()> {
    ensure_exists(conn, "users", "user_id", "user", user_id.to_string())
}

fn ensure_link_exists(conn: &Connection, link_id: LinkId) -> Result<()> {
    ensure_exists(conn, "links", "link_id", "link", link_id.to_string())
}

fn load_user(conn: &Connection, user_id: UserId) -> Result<User> {
    query_one(
        conn,
        "SELECT user_id, name, created_at FROM users WHERE user_id = ?1",
        params![user_id.to_string()],
        user_from_row,
    )?
    .ok_or_else(|| LedgerError::not_found("user", user_id).into())
}

fn load_link(conn: &Connection, link_id: LinkId) -> Result<Link> {
    query_one(
        conn,
        "SELECT link_id, user_id, title, url, description, created_at, updated_at
         FROM links WHERE link_id = ?1",
        params![link_id.to_string()],
        link_from_row,
    )?
    .ok_or_else(|| LedgerError::not_found("link", link_id).into())
}

fn load_comment(conn: &Connection, comment_id: CommentId) -> Result<Comment> {
    query_one(
        conn,
        &format!("{COMMENT_SELECT} WHERE c.comment_id = ?1"),
        params![comment_id.to_string()],
        comment_from_row,
    )?
    .ok_or_else(|| LedgerError::not_found("comment", comment_id).into())
}

fn query_one<T, P, F>(conn: &Connection, sql: &str, params: P, map: F) -> Result<Option<T>>
where
    P: rusqlite::Params,
    F: FnOnce(&Row<'_>) -> Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let row = rows.next()?;
    let value = match row {
        Some(row) => Some(map(row)?),
        None => None,
    };
    Ok(value)
}

fn user_from_row(row: &Row<'_>) -> Result<User> {
    Ok(User {
        user_id: UserId::parse(&row.get::<_, String>(0)?)?,
        name: row.get(1)?,
        created_at: parse_timestamp(&row.get::<_, String>(2)?)?,
    })
}

fn link_from_row(row: &Row<'_>) -> Result<Link> {
    Ok(Link {
        link_id: LinkId::parse(&row.get::<_, String>(0)?)?,
        user_id: UserId::parse(&row.get::<_, String>(1)?)?,
        title: row.get(2)?,
        url: row.get(3)?,
        description: row.get(4)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(6)?)?,
    })
}

fn link_summary_from_row(row: &Row<'_>) -> Result<LinkSummary> {
    Ok(LinkSummary {
        link: link_from_row(row)?,
        tally: VoteTally::from_counts(row.get(7)?, row.get(8)?),
        comments_count: row.get(9)?,
        submitter_name: row.get(10)?,
    })
}

fn comment_from_row(row: &Row<'_>) -> Result<Comment> {
    let parent_raw: Option<String> = row.get(3)?;
    Ok(Comment {
        comment_id: CommentId::parse(&row.get::<_, String>(0)?)?,
        link_id: LinkId::parse(&row.get::<_, String>(1)?)?,
        user_id: UserId::parse(&row.get::<_, String>(2)?)?,
        parent_id: parent_raw.as_deref().map(CommentId::parse).transpose()?,
        author_name: row.get(7)?,
        content: row.get(4)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(6)?)?,
    })
}

fn vote_from_row(row: &Row<'_>) -> Result<Vote> {
    Ok(Vote {
        user_id: UserId::parse(&row.get::<_, String>(0)?)?,
        link_id: LinkId::parse(&row.get::<_, String>(1)?)?,
        kind: parse_vote_kind(&row.get::<_, String>(2)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, timestamp(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Fixed-width RFC 3339 in UTC so text order matches time order.
fn timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .context("failed to format timestamp")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
