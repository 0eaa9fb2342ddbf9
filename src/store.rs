//! Mirror Store - SQLite-based persistence for mirrored entities and sync bookkeeping
//!
//! This module provides:
//! - Idempotent entity upserts keyed by upstream node id
//! - The reads reconciliation needs (previous issue payloads, pending review requests)
//! - Sync run records and per-resource watermarks
//!
//! The database is stored in XDG_DATA_HOME/orgmirror/mirror.db by default

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::model::{
    format_timestamp, CommentRecord, IssueRecord, PendingReviewRequest, PullRequestRecord,
    ReactionRecord, RepositoryRecord, ResourceKind, ReviewRecord, ReviewRequestRecord,
    SyncRunStatus, UserRecord,
};
use crate::window::parse_timestamp;

/// Persistence contract the engine depends on
///
/// Every upsert is idempotent on the entity's primary id and overwrites
/// mutable fields and the raw payload.
pub trait MirrorStore: Send + Sync {
    fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<()>;
    fn upsert_user(&self, user: &UserRecord) -> Result<()>;
    fn upsert_issue(&self, issue: &IssueRecord) -> Result<()>;
    fn upsert_pull_request(&self, pr: &PullRequestRecord) -> Result<()>;
    fn upsert_review(&self, review: &ReviewRecord) -> Result<()>;
    fn upsert_comment(&self, comment: &CommentRecord) -> Result<()>;
    fn upsert_reaction(&self, reaction: &ReactionRecord) -> Result<()>;
    fn upsert_review_request(&self, request: &ReviewRequestRecord) -> Result<()>;

    /// Replace the assignee set of an issue, discussion or pull request.
    fn replace_assignees(&self, item_id: &str, user_ids: &[String]) -> Result<()>;

    /// Previously stored raw payloads for the given issue ids.
    fn fetch_issue_raw_map(&self, ids: &[String]) -> Result<HashMap<String, Value>>;

    /// Active (not removed) review requests, grouped by pull request id.
    fn list_pending_review_requests(
        &self,
        pull_request_ids: &[String],
    ) -> Result<HashMap<String, Vec<PendingReviewRequest>>>;

    fn review_exists(&self, id: &str) -> Result<bool>;

    fn record_sync_log(
        &self,
        resource: ResourceKind,
        status: SyncRunStatus,
        message: Option<&str>,
        run_id: Option<i64>,
    ) -> Result<i64>;

    fn update_sync_log(&self, log_id: i64, status: SyncRunStatus, message: Option<&str>) -> Result<()>;

    /// Advance a watermark. The stored value never moves backwards.
    fn update_sync_state(
        &self,
        resource: ResourceKind,
        scope_key: &str,
        watermark: DateTime<Utc>,
    ) -> Result<()>;

    fn sync_state(&self, resource: ResourceKind, scope_key: &str) -> Result<Option<DateTime<Utc>>>;

    fn clear_activity_statuses(&self, issue_id: &str) -> Result<()>;
    fn clear_project_field_overrides(&self, issue_id: &str) -> Result<()>;
}

/// A sync run row
#[derive(Debug, Clone)]
pub struct SyncLogEntry {
    pub id: i64,
    pub resource: String,
    pub status: SyncRunStatus,
    pub message: Option<String>,
    pub run_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A stored watermark
#[derive(Debug, Clone)]
pub struct SyncStateEntry {
    pub resource: String,
    pub scope_key: String,
    pub watermark: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite implementation of [`MirrorStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn to_json(value: &Value) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize raw payload")
}

fn parse_stored_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_timestamp)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl SqliteStore {
    /// Open or create the mirror database at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!("Mirror database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Mirror database connection lock poisoned"))
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repositories (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    name_with_owner TEXT NOT NULL,
                    url TEXT,
                    is_private INTEGER NOT NULL DEFAULT 0,
                    is_archived INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    login TEXT NOT NULL,
                    name TEXT,
                    avatar_url TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id TEXT PRIMARY KEY,
                    repository_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT,
                    state TEXT NOT NULL,
                    author_id TEXT,
                    url TEXT,
                    labels TEXT,
                    created_at TEXT,
                    updated_at TEXT,
                    closed_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pull_requests (
                    id TEXT PRIMARY KEY,
                    repository_id TEXT NOT NULL,
                    number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT,
                    state TEXT NOT NULL,
                    is_draft INTEGER NOT NULL DEFAULT 0,
                    author_id TEXT,
                    url TEXT,
                    labels TEXT,
                    created_at TEXT,
                    updated_at TEXT,
                    closed_at TEXT,
                    merged_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS reviews (
                    id TEXT PRIMARY KEY,
                    pull_request_id TEXT NOT NULL,
                    author_id TEXT,
                    state TEXT NOT NULL,
                    body TEXT,
                    url TEXT,
                    submitted_at TEXT,
                    updated_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS comments (
                    id TEXT PRIMARY KEY,
                    subject_id TEXT NOT NULL,
                    subject_type TEXT NOT NULL,
                    author_id TEXT,
                    review_id TEXT,
                    reply_to_id TEXT,
                    is_answer INTEGER NOT NULL DEFAULT 0,
                    body TEXT,
                    url TEXT,
                    created_at TEXT,
                    updated_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS reactions (
                    id TEXT PRIMARY KEY,
                    subject_id TEXT NOT NULL,
                    subject_type TEXT NOT NULL,
                    user_id TEXT,
                    content TEXT NOT NULL,
                    created_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS review_requests (
                    id TEXT PRIMARY KEY,
                    pull_request_id TEXT NOT NULL,
                    reviewer_id TEXT NOT NULL,
                    requested_at TEXT NOT NULL,
                    removed_at TEXT,
                    raw TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS item_assignees (
                    item_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    PRIMARY KEY (item_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS sync_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    resource TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT,
                    run_id INTEGER,
                    started_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    resource TEXT NOT NULL,
                    scope_key TEXT NOT NULL,
                    last_item_timestamp TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (resource, scope_key)
                );

                -- Derived rows owned by downstream analytics; only cleared here
                CREATE TABLE IF NOT EXISTS activity_statuses (
                    issue_id TEXT PRIMARY KEY,
                    status TEXT,
                    computed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS project_field_overrides (
                    issue_id TEXT NOT NULL,
                    field TEXT NOT NULL,
                    value TEXT,
                    PRIMARY KEY (issue_id, field)
                );

                CREATE INDEX IF NOT EXISTS idx_issues_repo ON issues(repository_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_prs_repo ON pull_requests(repository_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_reviews_pr ON reviews(pull_request_id);
                CREATE INDEX IF NOT EXISTS idx_comments_subject ON comments(subject_id);
                CREATE INDEX IF NOT EXISTS idx_reactions_subject ON reactions(subject_id);
                CREATE INDEX IF NOT EXISTS idx_review_requests_pr ON review_requests(pull_request_id, removed_at);
                CREATE INDEX IF NOT EXISTS idx_sync_log_resource ON sync_log(resource, started_at);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Operator reads
    // =========================================================================

    /// All stored watermarks
    pub fn list_sync_states(&self) -> Result<Vec<SyncStateEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT resource, scope_key, last_item_timestamp, updated_at
            FROM sync_state
            ORDER BY scope_key, resource
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query sync state")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect sync state")?;

        Ok(rows
            .into_iter()
            .filter_map(|(resource, scope_key, watermark, updated_at)| {
                Some(SyncStateEntry {
                    resource,
                    scope_key,
                    watermark: parse_timestamp(&watermark)?,
                    updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
                })
            })
            .collect())
    }

    /// Most recent sync runs, newest first
    pub fn recent_sync_logs(&self, limit: u32) -> Result<Vec<SyncLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, resource, status, message, run_id, started_at, finished_at
            FROM sync_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(SyncLogEntry {
                    id: row.get(0)?,
                    resource: row.get(1)?,
                    status: SyncRunStatus::parse(&row.get::<_, String>(2)?)
                        .unwrap_or(SyncRunStatus::Failed),
                    message: row.get(3)?,
                    run_id: row.get(4)?,
                    started_at: parse_stored_time(row.get(5)?).unwrap_or_else(Utc::now),
                    finished_at: parse_stored_time(row.get(6)?),
                })
            })
            .context("Failed to query sync log")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect sync log")?;

        Ok(entries)
    }

    /// Number of rows in a mirrored table
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        const TABLES: &[&str] = &[
            "repositories",
            "users",
            "issues",
            "pull_requests",
            "reviews",
            "comments",
            "reactions",
            "review_requests",
            "item_assignees",
            "sync_log",
        ];
        if !TABLES.contains(&table) {
            return Err(anyhow!("Unknown table: {}", table));
        }
        let conn = self.conn()?;
        let count = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .with_context(|| format!("Failed to count {}", table))?;
        Ok(count)
    }

    /// Stored raw payload of any mirrored entity
    pub fn raw_payload(&self, table: &str, id: &str) -> Result<Option<Value>> {
        if self.count_rows(table).is_err() || table == "item_assignees" || table == "sync_log" {
            return Err(anyhow!("Unknown entity table: {}", table));
        }
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT raw FROM {} WHERE id = ?1", table),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read {} {}", table, id))?;

        raw.map(|text| serde_json::from_str(&text).context("Stored raw payload is not JSON"))
            .transpose()
    }

    /// Review request row by id: (reviewer id, removed_at)
    pub fn review_request_state(&self, id: &str) -> Result<Option<(String, Option<String>)>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT reviewer_id, removed_at FROM review_requests WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("Failed to query review request")
    }

    /// Assignee user ids of an item, sorted
    pub fn assignees(&self, item_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT user_id FROM item_assignees WHERE item_id = ?1 ORDER BY user_id")?;
        let ids = stmt
            .query_map(params![item_id], |row| row.get(0))
            .context("Failed to query assignees")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to collect assignees")?;
        Ok(ids)
    }
}

impl MirrorStore for SqliteStore {
    fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO repositories (id, name, name_with_owner, url, is_private, is_archived, updated_at, raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    name_with_owner = excluded.name_with_owner,
                    url = excluded.url,
                    is_private = excluded.is_private,
                    is_archived = excluded.is_archived,
                    updated_at = excluded.updated_at,
                    raw = excluded.raw
                "#,
                params![
                    repo.id,
                    repo.name,
                    repo.name_with_owner,
                    repo.url,
                    repo.is_private,
                    repo.is_archived,
                    repo.updated_at,
                    to_json(&repo.raw)?,
                ],
            )
            .context("Failed to upsert repository")?;

        debug!("Upserted repository {}", repo.name_with_owner);
        Ok(())
    }

    fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO users (id, login, name, avatar_url, raw)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    login = excluded.login,
                    name = COALESCE(excluded.name, name),
                    avatar_url = COALESCE(excluded.avatar_url, avatar_url),
                    raw = excluded.raw
                "#,
                params![user.id, user.login, user.name, user.avatar_url, to_json(&user.raw)?],
            )
            .context("Failed to upsert user")?;
        Ok(())
    }

    fn upsert_issue(&self, issue: &IssueRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO issues (id, repository_id, kind, number, title, body, state, author_id, url, labels, created_at, updated_at, closed_at, raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT(id) DO UPDATE SET
                    repository_id = excluded.repository_id,
                    kind = excluded.kind,
                    number = excluded.number,
                    title = excluded.title,
                    body = excluded.body,
                    state = excluded.state,
                    author_id = excluded.author_id,
                    url = excluded.url,
                    labels = excluded.labels,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    closed_at = excluded.closed_at,
                    raw = excluded.raw
                "#,
                params![
                    issue.id,
                    issue.repository_id,
                    issue.kind.as_str(),
                    issue.number,
                    issue.title,
                    issue.body,
                    issue.state,
                    issue.author_id,
                    issue.url,
                    issue.labels.join(","),
                    issue.created_at,
                    issue.updated_at,
                    issue.closed_at,
                    to_json(&issue.raw)?,
                ],
            )
            .context("Failed to upsert issue")?;

        debug!("Upserted {} {}", issue.kind.as_str(), issue.id);
        Ok(())
    }

    fn upsert_pull_request(&self, pr: &PullRequestRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO pull_requests (id, repository_id, number, title, body, state, is_draft, author_id, url, labels, created_at, updated_at, closed_at, merged_at, raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(id) DO UPDATE SET
                    repository_id = excluded.repository_id,
                    number = excluded.number,
                    title = excluded.title,
                    body = excluded.body,
                    state = excluded.state,
                    is_draft = excluded.is_draft,
                    author_id = excluded.author_id,
                    url = excluded.url,
                    labels = excluded.labels,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    closed_at = excluded.closed_at,
                    merged_at = excluded.merged_at,
                    raw = excluded.raw
                "#,
                params![
                    pr.id,
                    pr.repository_id,
                    pr.number,
                    pr.title,
                    pr.body,
                    pr.state,
                    pr.is_draft,
                    pr.author_id,
                    pr.url,
                    pr.labels.join(","),
                    pr.created_at,
                    pr.updated_at,
                    pr.closed_at,
                    pr.merged_at,
                    to_json(&pr.raw)?,
                ],
            )
            .context("Failed to upsert pull request")?;

        debug!("Upserted pull request {}", pr.id);
        Ok(())
    }

    fn upsert_review(&self, review: &ReviewRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO reviews (id, pull_request_id, author_id, state, body, url, submitted_at, updated_at, raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    pull_request_id = excluded.pull_request_id,
                    author_id = excluded.author_id,
                    state = excluded.state,
                    body = excluded.body,
                    url = excluded.url,
                    submitted_at = excluded.submitted_at,
                    updated_at = excluded.updated_at,
                    raw = excluded.raw
                "#,
                params![
                    review.id,
                    review.pull_request_id,
                    review.author_id,
                    review.state,
                    review.body,
                    review.url,
                    review.submitted_at,
                    review.updated_at,
                    to_json(&review.raw)?,
                ],
            )
            .context("Failed to upsert review")?;
        Ok(())
    }

    fn upsert_comment(&self, comment: &CommentRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO comments (id, subject_id, subject_type, author_id, review_id, reply_to_id, is_answer, body, url, created_at, updated_at, raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(id) DO UPDATE SET
                    subject_id = excluded.subject_id,
                    subject_type = excluded.subject_type,
                    author_id = excluded.author_id,
                    review_id = excluded.review_id,
                    reply_to_id = excluded.reply_to_id,
                    is_answer = excluded.is_answer,
                    body = excluded.body,
                    url = excluded.url,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    raw = excluded.raw
                "#,
                params![
                    comment.id,
                    comment.subject_id,
                    comment.subject_type.as_str(),
                    comment.author_id,
                    comment.review_id,
                    comment.reply_to_id,
                    comment.is_answer,
                    comment.body,
                    comment.url,
                    comment.created_at,
                    comment.updated_at,
                    to_json(&comment.raw)?,
                ],
            )
            .context("Failed to upsert comment")?;
        Ok(())
    }

    fn upsert_reaction(&self, reaction: &ReactionRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO reactions (id, subject_id, subject_type, user_id, content, created_at, raw)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    subject_id = excluded.subject_id,
                    subject_type = excluded.subject_type,
                    user_id = excluded.user_id,
                    content = excluded.content,
                    created_at = excluded.created_at,
                    raw = excluded.raw
                "#,
                params![
                    reaction.id,
                    reaction.subject_id,
                    reaction.subject_type.as_str(),
                    reaction.user_id,
                    reaction.content,
                    reaction.created_at,
                    to_json(&reaction.raw)?,
                ],
            )
            .context("Failed to upsert reaction")?;
        Ok(())
    }

    fn upsert_review_request(&self, request: &ReviewRequestRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to begin review request transaction")?;

        // one active request per (pull request, reviewer)
        if request.removed_at.is_none() {
            tx.execute(
                r#"
                UPDATE review_requests SET removed_at = ?1
                WHERE pull_request_id = ?2 AND reviewer_id = ?3 AND id <> ?4 AND removed_at IS NULL
                "#,
                params![
                    format_timestamp(Utc::now()),
                    request.pull_request_id,
                    request.reviewer_id,
                    request.id
                ],
            )
            .context("Failed to retire superseded review request")?;
        }

        tx.execute(
            r#"
            INSERT INTO review_requests (id, pull_request_id, reviewer_id, requested_at, removed_at, raw)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                pull_request_id = excluded.pull_request_id,
                reviewer_id = excluded.reviewer_id,
                requested_at = excluded.requested_at,
                removed_at = excluded.removed_at,
                raw = excluded.raw
            "#,
            params![
                request.id,
                request.pull_request_id,
                request.reviewer_id,
                request.requested_at,
                request.removed_at,
                to_json(&request.raw)?,
            ],
        )
        .context("Failed to upsert review request")?;

        tx.commit().context("Failed to commit review request")?;
        Ok(())
    }

    fn replace_assignees(&self, item_id: &str, user_ids: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to begin assignee transaction")?;

        tx.execute("DELETE FROM item_assignees WHERE item_id = ?1", params![item_id])
            .context("Failed to clear assignees")?;
        for user_id in user_ids {
            tx.execute(
                "INSERT OR IGNORE INTO item_assignees (item_id, user_id) VALUES (?1, ?2)",
                params![item_id, user_id],
            )
            .context("Failed to insert assignee")?;
        }

        tx.commit().context("Failed to commit assignees")?;
        Ok(())
    }

    fn fetch_issue_raw_map(&self, ids: &[String]) -> Result<HashMap<String, Value>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, raw FROM issues WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query issue payloads")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect issue payloads")?;

        let mut map = HashMap::with_capacity(rows.len());
        for (id, raw) in rows {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Stored payload for issue {} is not JSON", id))?;
            map.insert(id, value);
        }
        Ok(map)
    }

    fn list_pending_review_requests(
        &self,
        pull_request_ids: &[String],
    ) -> Result<HashMap<String, Vec<PendingReviewRequest>>> {
        if pull_request_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.conn()?;
        let sql = format!(
            r#"
            SELECT id, pull_request_id, reviewer_id, requested_at
            FROM review_requests
            WHERE removed_at IS NULL AND pull_request_id IN ({})
            ORDER BY requested_at
            "#,
            placeholders(pull_request_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;

        let pending = stmt
            .query_map(params_from_iter(pull_request_ids.iter()), |row| {
                Ok(PendingReviewRequest {
                    id: row.get(0)?,
                    pull_request_id: row.get(1)?,
                    reviewer_id: row.get(2)?,
                    requested_at: row.get(3)?,
                })
            })
            .context("Failed to query pending review requests")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect pending review requests")?;

        let mut grouped: HashMap<String, Vec<PendingReviewRequest>> = HashMap::new();
        for request in pending {
            grouped
                .entry(request.pull_request_id.clone())
                .or_default()
                .push(request);
        }
        Ok(grouped)
    }

    fn review_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()?
            .query_row("SELECT 1 FROM reviews WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to query review")?;
        Ok(found.is_some())
    }

    fn record_sync_log(
        &self,
        resource: ResourceKind,
        status: SyncRunStatus,
        message: Option<&str>,
        run_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_log (resource, status, message, run_id, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                resource.as_str(),
                status.as_str(),
                message,
                run_id,
                format_timestamp(Utc::now()),
            ],
        )
        .context("Failed to record sync log")?;

        let id = conn.last_insert_rowid();
        debug!("Recorded sync run {} for {}", id, resource.as_str());
        Ok(id)
    }

    fn update_sync_log(&self, log_id: i64, status: SyncRunStatus, message: Option<&str>) -> Result<()> {
        let finished_at = match status {
            SyncRunStatus::Running => None,
            _ => Some(format_timestamp(Utc::now())),
        };
        self.conn()?
            .execute(
                "UPDATE sync_log SET status = ?1, message = ?2, finished_at = ?3 WHERE id = ?4",
                params![status.as_str(), message, finished_at, log_id],
            )
            .context("Failed to update sync log")?;
        Ok(())
    }

    fn update_sync_state(
        &self,
        resource: ResourceKind,
        scope_key: &str,
        watermark: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to begin sync state transaction")?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT last_item_timestamp FROM sync_state WHERE resource = ?1 AND scope_key = ?2",
                params![resource.as_str(), scope_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read sync state")?;

        let next = match previous.as_deref().and_then(parse_timestamp) {
            Some(prev) if prev >= watermark => prev,
            _ => watermark,
        };

        tx.execute(
            r#"
            INSERT INTO sync_state (resource, scope_key, last_item_timestamp, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(resource, scope_key) DO UPDATE SET
                last_item_timestamp = excluded.last_item_timestamp,
                updated_at = excluded.updated_at
            "#,
            params![
                resource.as_str(),
                scope_key,
                format_timestamp(next),
                format_timestamp(Utc::now()),
            ],
        )
        .context("Failed to update sync state")?;

        tx.commit().context("Failed to commit sync state")?;
        debug!(
            "Watermark {}/{} -> {}",
            scope_key,
            resource.as_str(),
            format_timestamp(next)
        );
        Ok(())
    }

    fn sync_state(&self, resource: ResourceKind, scope_key: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn()?
            .query_row(
                "SELECT last_item_timestamp FROM sync_state WHERE resource = ?1 AND scope_key = ?2",
                params![resource.as_str(), scope_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read sync state")?;
        Ok(value.as_deref().and_then(parse_timestamp))
    }

    fn clear_activity_statuses(&self, issue_id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM activity_statuses WHERE issue_id = ?1", params![issue_id])
            .context("Failed to clear activity statuses")?;
        Ok(())
    }

    fn clear_project_field_overrides(&self, issue_id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM project_field_overrides WHERE issue_id = ?1",
                params![issue_id],
            )
            .context("Failed to clear project field overrides")?;
        Ok(())
    }
}
