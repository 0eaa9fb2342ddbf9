//! Targeted node resync
//!
//! Repairs a single issue, pull request or discussion by global node id,
//! outside any sync window. The node goes through the same reconciliation
//! and child collection as the bulk passes.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

use crate::collectors::{repository_record, Collector, ReviewTally};
use crate::error::SyncError;
use crate::executor::ExecuteOptions;
use crate::graphql::{queries, DiscussionNode, IssueNode, PullRequestNode, RepositoryNode, SingleNodeData};
use crate::model::{NodeKind, Tally};
use crate::reconcile::ReviewRequestDelta;
use crate::window::WindowBounds;

/// A fetched node, keyed by its `__typename`
#[derive(Debug)]
pub enum FetchedNode {
    Issue(Box<IssueNode>),
    PullRequest(Box<PullRequestNode>),
    Discussion(Box<DiscussionNode>),
}

impl FetchedNode {
    /// Decode a raw `node` payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let typename = value
            .get("__typename")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match NodeKind::from_typename(&typename) {
            NodeKind::Issue => Ok(Self::Issue(Box::new(
                serde_json::from_value(value).context("Failed to decode issue")?,
            ))),
            NodeKind::PullRequest => Ok(Self::PullRequest(Box::new(
                serde_json::from_value(value).context("Failed to decode pull request")?,
            ))),
            NodeKind::Discussion => Ok(Self::Discussion(Box::new(
                serde_json::from_value(value).context("Failed to decode discussion")?,
            ))),
            NodeKind::IssueComment
            | NodeKind::DiscussionComment
            | NodeKind::PullRequestReview
            | NodeKind::PullRequestReviewComment
            | NodeKind::Unsupported(_) => Err(SyncError::validation(format!(
                "unsupported node type {}",
                if typename.is_empty() { "<unknown>" } else { typename.as_str() }
            ))
            .into()),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Issue(_) => NodeKind::Issue,
            Self::PullRequest(_) => NodeKind::PullRequest,
            Self::Discussion(_) => NodeKind::Discussion,
        }
    }

    fn repository(&self) -> Option<&RepositoryNode> {
        match self {
            Self::Issue(node) => node.repository.as_ref(),
            Self::PullRequest(node) => node.repository.as_ref(),
            Self::Discussion(node) => node.repository.as_ref(),
        }
    }
}

/// What a resync refreshed
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncOutcome {
    pub node_id: String,
    pub kind: NodeKind,
    pub repository: String,
    pub comments: Tally,
    pub reviews: ReviewTally,
    pub review_requests: ReviewRequestDelta,
}

impl fmt::Display for ResyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} in {}: {} comments",
            self.kind, self.node_id, self.repository, self.comments.count
        )?;
        if self.kind == NodeKind::PullRequest {
            write!(
                f,
                ", {} reviews ({} new), review requests +{} -{}",
                self.reviews.tally.count,
                self.reviews.new_reviews,
                self.review_requests.added,
                self.review_requests.removed
            )?;
        }
        Ok(())
    }
}

impl Collector {
    /// Refresh one node and its children unconditionally.
    pub async fn resync_node(&self, node_id: &str) -> Result<ResyncOutcome> {
        self.resync_inner(node_id)
            .await
            .with_context(|| format!("node {}", node_id))
    }

    async fn resync_inner(&self, node_id: &str) -> Result<ResyncOutcome> {
        let data: SingleNodeData = self
            .executor()
            .execute(
                &queries::node(),
                json!({
                    "id": node_id,
                    "statusField": self.settings().status_field,
                }),
                ExecuteOptions::new(format!("node {}", node_id)),
            )
            .await?;

        let value = data
            .node
            .ok_or_else(|| SyncError::not_found(format!("node {} does not exist", node_id)))?;
        let node = FetchedNode::from_value(value)?;

        let repository = node
            .repository()
            .ok_or_else(|| SyncError::unclassified("node carries no repository"))?;
        self.store()
            .upsert_repository(&repository_record(repository)?)
            .with_context(|| format!("Failed to store repository {}", repository.name_with_owner))?;

        let unbounded = WindowBounds::unbounded();
        let mut outcome = ResyncOutcome {
            node_id: node_id.to_string(),
            kind: node.kind(),
            repository: repository.name_with_owner.clone(),
            comments: Tally::default(),
            reviews: ReviewTally::default(),
            review_requests: ReviewRequestDelta::default(),
        };

        match &node {
            FetchedNode::Issue(issue) => {
                let previous = self
                    .store()
                    .fetch_issue_raw_map(std::slice::from_ref(&issue.id))?;
                outcome.comments = self
                    .process_issue(&repository.id, issue, previous.get(&issue.id), &unbounded)
                    .await?;
            }
            FetchedNode::PullRequest(pr) => {
                let mut pending = self
                    .store()
                    .list_pending_review_requests(std::slice::from_ref(&pr.id))?;
                let children = self
                    .process_pull_request(
                        &repository.id,
                        pr,
                        &pending.remove(&pr.id).unwrap_or_default(),
                        &unbounded,
                        &unbounded,
                    )
                    .await?;
                outcome.comments = children.comments;
                outcome.reviews = children.reviews;
                outcome.review_requests = children.review_requests;
            }
            FetchedNode::Discussion(discussion) => {
                outcome.comments = self
                    .process_discussion(&repository.id, discussion, &unbounded)
                    .await?;
            }
        }

        info!("Resynced {}", outcome);
        Ok(outcome)
    }
}
