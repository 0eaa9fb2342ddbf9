//! Normalized entities written to the mirror store
//!
//! Records are flat, store-shaped views of upstream nodes. Each carries the
//! full normalized node as `raw` so later reconciliation can read back what
//! was previously observed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Resource keys used for watermarks and sync runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Repositories,
    Issues,
    Discussions,
    PullRequests,
    Reviews,
    Comments,
    /// Open-item metadata refresh; has a run record but no watermark.
    OpenItems,
}

impl ResourceKind {
    /// Resources that carry a watermark.
    pub const WATERMARKED: [ResourceKind; 6] = [
        ResourceKind::Repositories,
        ResourceKind::Issues,
        ResourceKind::Discussions,
        ResourceKind::PullRequests,
        ResourceKind::Reviews,
        ResourceKind::Comments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Repositories => "repositories",
            ResourceKind::Issues => "issues",
            ResourceKind::Discussions => "discussions",
            ResourceKind::PullRequests => "pull_requests",
            ResourceKind::Reviews => "reviews",
            ResourceKind::Comments => "comments",
            ResourceKind::OpenItems => "open_items",
        }
    }
}

/// Upstream node kinds, resolved from `__typename`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Issue,
    PullRequest,
    Discussion,
    IssueComment,
    DiscussionComment,
    PullRequestReview,
    PullRequestReviewComment,
    Unsupported(String),
}

impl NodeKind {
    /// The single place upstream typenames are interpreted.
    pub fn from_typename(typename: &str) -> Self {
        match typename {
            "Issue" => NodeKind::Issue,
            "PullRequest" => NodeKind::PullRequest,
            "Discussion" => NodeKind::Discussion,
            "IssueComment" => NodeKind::IssueComment,
            "DiscussionComment" => NodeKind::DiscussionComment,
            "PullRequestReview" => NodeKind::PullRequestReview,
            "PullRequestReviewComment" => NodeKind::PullRequestReviewComment,
            other => NodeKind::Unsupported(other.to_string()),
        }
    }

    /// Subject type recorded for reactions and comments attached to this kind.
    pub fn subject_type(&self) -> Option<SubjectType> {
        match self {
            NodeKind::Issue => Some(SubjectType::Issue),
            NodeKind::PullRequest => Some(SubjectType::PullRequest),
            NodeKind::Discussion => Some(SubjectType::Discussion),
            NodeKind::IssueComment
            | NodeKind::DiscussionComment
            | NodeKind::PullRequestReviewComment => Some(SubjectType::Comment),
            NodeKind::PullRequestReview => Some(SubjectType::Review),
            NodeKind::Unsupported(_) => None,
        }
    }
}

/// What a reaction or comment hangs off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
    Issue,
    PullRequest,
    Discussion,
    Review,
    Comment,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Issue => "issue",
            SubjectType::PullRequest => "pull_request",
            SubjectType::Discussion => "discussion",
            SubjectType::Review => "review",
            SubjectType::Comment => "comment",
        }
    }

    /// Resolve from an optional typename, falling back to the caller's context.
    pub fn resolve(typename: Option<&str>, fallback: SubjectType) -> SubjectType {
        typename
            .and_then(|t| NodeKind::from_typename(t).subject_type())
            .unwrap_or(fallback)
    }
}

/// Issues and discussions share one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Issue,
    Discussion,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Issue => "issue",
            IssueKind::Discussion => "discussion",
        }
    }
}

/// Status of a sync run record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRunStatus {
    Running,
    Success,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SyncRunStatus::Running),
            "success" => Some(SyncRunStatus::Success),
            "failed" => Some(SyncRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRecord {
    pub id: String,
    pub name: String,
    pub name_with_owner: String,
    pub url: Option<String>,
    pub is_private: bool,
    pub is_archived: bool,
    pub updated_at: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub login: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueRecord {
    pub id: String,
    pub repository_id: String,
    pub kind: IssueKind,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub author_id: Option<String>,
    pub url: Option<String>,
    pub labels: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestRecord {
    pub id: String,
    pub repository_id: String,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub is_draft: bool,
    pub author_id: Option<String>,
    pub url: Option<String>,
    pub labels: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    pub id: String,
    pub pull_request_id: String,
    pub author_id: Option<String>,
    pub state: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub submitted_at: Option<String>,
    pub updated_at: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentRecord {
    pub id: String,
    pub subject_id: String,
    pub subject_type: SubjectType,
    pub author_id: Option<String>,
    pub review_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub is_answer: bool,
    pub body: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionRecord {
    pub id: String,
    pub subject_id: String,
    pub subject_type: SubjectType,
    pub user_id: Option<String>,
    pub content: String,
    pub created_at: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequestRecord {
    pub id: String,
    pub pull_request_id: String,
    pub reviewer_id: String,
    pub requested_at: String,
    pub removed_at: Option<String>,
    pub raw: Value,
}

/// A review request the store still considers active
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReviewRequest {
    pub id: String,
    pub pull_request_id: String,
    pub reviewer_id: String,
    pub requested_at: String,
}

/// Highest timestamp and node count seen by one collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub count: usize,
    pub latest: Option<DateTime<Utc>>,
}

impl Tally {
    /// Count one included node and fold its timestamp into `latest`.
    pub fn observe(&mut self, updated_at: Option<DateTime<Utc>>) {
        self.count += 1;
        self.bump(updated_at);
    }

    pub fn bump(&mut self, ts: Option<DateTime<Utc>>) {
        if let Some(ts) = ts {
            self.latest = Some(self.latest.map_or(ts, |cur| cur.max(ts)));
        }
    }

    pub fn merge(&mut self, other: Tally) {
        self.count += other.count;
        self.bump(other.latest);
    }
}

/// Canonical text form used for every stored timestamp.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
