use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::issues::strip_repository;
use super::{label_names, owner_and_name, CommentScope, CommentsAccumulator, Collector};
use crate::error::is_not_found;
use crate::executor::ExecuteOptions;
use crate::graphql::{
    queries, NodeReviewsData, PullRequestNode, RepoPullRequestsData, RepositoryNode,
    ReviewRequestNode,
};
use crate::model::{PendingReviewRequest, PullRequestRecord, ReviewRecord, SubjectType, Tally};
use crate::reconcile::{reconcile_review_requests, ReviewRequestDelta};
use crate::window::{evaluate, parse_timestamp, WindowBounds};

/// Reviews stored by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewTally {
    pub tally: Tally,
    /// Reviews the store had never seen before.
    pub new_reviews: usize,
}

impl ReviewTally {
    pub fn merge(&mut self, other: ReviewTally) {
        self.tally.merge(other.tally);
        self.new_reviews += other.new_reviews;
    }
}

/// Everything one pull-request pass stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullRequestTally {
    pub pull_requests: Tally,
    pub reviews: ReviewTally,
    pub review_requests: ReviewRequestDelta,
}

impl PullRequestTally {
    pub fn merge(&mut self, other: PullRequestTally) {
        self.pull_requests.merge(other.pull_requests);
        self.reviews.merge(other.reviews);
        self.review_requests.merge(other.review_requests);
    }
}

/// Child results of one pull request
#[derive(Debug, Default)]
pub(crate) struct PullRequestChildren {
    pub comments: Tally,
    pub reviews: ReviewTally,
    pub review_requests: ReviewRequestDelta,
}

impl Collector {
    /// Collect pull requests of one repository, newest first, with their
    /// review requests, reviews and comments.
    pub async fn collect_pull_requests(
        &self,
        repo: &RepositoryNode,
        bounds: &WindowBounds,
        review_bounds: &WindowBounds,
        comment_bounds: &WindowBounds,
        comments: &mut CommentsAccumulator,
    ) -> Result<PullRequestTally> {
        let query = queries::pull_requests();
        let (owner, name) = owner_and_name(repo);
        let mut result = PullRequestTally::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let data: RepoPullRequestsData = self
                .executor
                .execute(
                    &query,
                    json!({
                        "owner": owner,
                        "name": name,
                        "cursor": cursor,
                        "pageSize": self.settings.page_size,
                    }),
                    ExecuteOptions::new(format!(
                        "pull requests of {} page {}",
                        repo.name_with_owner, page
                    )),
                )
                .await?;

            let Some(repository) = data.repository else {
                warn!(
                    "Repository {} disappeared while paging pull requests",
                    repo.name_with_owner
                );
                break;
            };
            let connection = repository.pull_requests;
            let next = connection.next_cursor();
            let nodes = connection.into_items();

            let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
            let pending = self
                .store
                .list_pending_review_requests(&ids)
                .context("Failed to load pending review requests")?;

            let mut reached_lower_bound = false;
            for pr in &nodes {
                let decision = evaluate(pr.updated_at.as_deref(), bounds);
                if decision.before_lower_bound {
                    reached_lower_bound = true;
                    break;
                }
                if !decision.include {
                    continue;
                }

                if result.pull_requests.count == 0 {
                    self.ensure_repository(repo)?;
                }
                let children = self
                    .process_pull_request(
                        &repo.id,
                        pr,
                        pending.get(&pr.id).map(Vec::as_slice).unwrap_or_default(),
                        review_bounds,
                        comment_bounds,
                    )
                    .await?;

                comments.record(children.comments);
                result.reviews.merge(children.reviews);
                result.review_requests.merge(children.review_requests);
                result
                    .pull_requests
                    .observe(pr.updated_at.as_deref().and_then(parse_timestamp));
            }

            if reached_lower_bound {
                debug!(
                    "Pull requests of {} reached the lower bound on page {}",
                    repo.name_with_owner, page
                );
                break;
            }
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        if result.pull_requests.count > 0 {
            info!(
                "Synced {} pull requests ({} reviews) from {}",
                result.pull_requests.count, result.reviews.tally.count, repo.name_with_owner
            );
        }
        Ok(result)
    }

    /// Store one pull request and everything hanging off it.
    pub(crate) async fn process_pull_request(
        &self,
        repository_id: &str,
        pr: &PullRequestNode,
        pending: &[PendingReviewRequest],
        review_bounds: &WindowBounds,
        comment_bounds: &WindowBounds,
    ) -> Result<PullRequestChildren> {
        let author_id = self.upsert_actor(pr.author.as_ref())?;

        let mut raw = serde_json::to_value(pr).context("Failed to encode pull request")?;
        strip_repository(&mut raw);

        self.store
            .upsert_pull_request(&PullRequestRecord {
                id: pr.id.clone(),
                repository_id: repository_id.to_string(),
                number: pr.number,
                title: pr.title.clone(),
                body: pr.body.clone(),
                state: pr.state.clone(),
                is_draft: pr.is_draft,
                author_id,
                url: pr.url.clone(),
                labels: label_names(&pr.labels),
                created_at: pr.created_at.clone(),
                updated_at: pr.updated_at.clone(),
                closed_at: pr.closed_at.clone(),
                merged_at: pr.merged_at.clone(),
                raw,
            })
            .with_context(|| format!("Failed to store pull request #{}", pr.number))?;

        self.sync_assignees(&pr.id, &pr.assignees)?;
        self.upsert_reactions(&pr.id, SubjectType::PullRequest, &pr.reactions)?;

        let live: Vec<ReviewRequestNode> = pr.review_requests.items().cloned().collect();
        let review_requests =
            reconcile_review_requests(self.store(), &pr.id, &live, pending, Utc::now())?;

        let mut seen = HashSet::new();
        let mut comments = self
            .collect_comments(
                CommentScope::new(&pr.id, SubjectType::PullRequest),
                comment_bounds,
                &mut seen,
            )
            .await?;

        let (reviews, review_comments) = self
            .collect_reviews(&pr.id, review_bounds, comment_bounds)
            .await?;
        comments.merge(review_comments);

        Ok(PullRequestChildren {
            comments,
            reviews,
            review_requests,
        })
    }

    /// Page the reviews of one pull request, oldest first, with their comments.
    ///
    /// Returns the review tally and the review-comment tally.
    pub async fn collect_reviews(
        &self,
        pull_request_id: &str,
        bounds: &WindowBounds,
        comment_bounds: &WindowBounds,
    ) -> Result<(ReviewTally, Tally)> {
        let query = queries::reviews();
        let mut reviews = ReviewTally::default();
        let mut comments = Tally::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let result: Result<NodeReviewsData> = self
                .executor
                .execute(
                    &query,
                    json!({
                        "id": pull_request_id,
                        "cursor": cursor,
                        "pageSize": self.settings.page_size,
                    }),
                    ExecuteOptions::new(format!("reviews of {} page {}", pull_request_id, page)),
                )
                .await;

            let data = match result {
                Ok(data) => data,
                Err(err) if is_not_found(&err) => {
                    warn!("Pull request {} not found while paging reviews", pull_request_id);
                    break;
                }
                Err(err) => return Err(err),
            };
            let Some(connection) = data.node.and_then(|n| n.reviews) else {
                warn!("Pull request {} no longer has reviews", pull_request_id);
                break;
            };

            for review in connection.items() {
                let updated = review
                    .updated_at
                    .as_deref()
                    .or(review.submitted_at.as_deref())
                    .or(review.created_at.as_deref());
                if !evaluate(updated, bounds).include {
                    continue;
                }

                let existed = self.store.review_exists(&review.id)?;
                let author_id = self.upsert_actor(review.author.as_ref())?;

                self.store
                    .upsert_review(&ReviewRecord {
                        id: review.id.clone(),
                        pull_request_id: pull_request_id.to_string(),
                        author_id,
                        state: review.state.clone(),
                        body: review.body.clone(),
                        url: review.url.clone(),
                        submitted_at: review.submitted_at.clone(),
                        updated_at: updated.map(str::to_string),
                        raw: serde_json::to_value(review).context("Failed to encode review")?,
                    })
                    .with_context(|| format!("Failed to store review {}", review.id))?;

                self.upsert_reactions(&review.id, SubjectType::Review, &review.reactions)?;

                if !existed {
                    reviews.new_reviews += 1;
                }
                reviews.tally.observe(updated.and_then(parse_timestamp));

                let mut seen = HashSet::new();
                let review_comments = self
                    .collect_comments(
                        CommentScope::new(&review.id, SubjectType::Review),
                        comment_bounds,
                        &mut seen,
                    )
                    .await?;
                comments.merge(review_comments);
            }

            match connection.next_cursor() {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok((reviews, comments))
    }
}
