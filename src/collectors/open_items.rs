use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use super::{owner_and_name, Collector};
use crate::executor::ExecuteOptions;
use crate::graphql::{queries, OpenIssuesData, OpenPullRequestsData, RepositoryNode, ReviewRequestNode};
use crate::reconcile::{reconcile_review_requests, ReviewRequestDelta};

/// Result of refreshing open-item metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenItemsTally {
    pub issues: usize,
    pub pull_requests: usize,
    pub review_requests: ReviewRequestDelta,
}

impl OpenItemsTally {
    pub fn merge(&mut self, other: OpenItemsTally) {
        self.issues += other.issues;
        self.pull_requests += other.pull_requests;
        self.review_requests.merge(other.review_requests);
    }
}

impl Collector {
    /// Refresh assignees of every open issue and pull request, and the
    /// review-request snapshot of every open pull request.
    ///
    /// No window applies: an open item's assignees can change without its
    /// update time moving past the watermark.
    pub async fn refresh_open_items(&self, repo: &RepositoryNode) -> Result<OpenItemsTally> {
        let issues = self.refresh_open_issues(repo).await?;
        let (pull_requests, review_requests) = self.refresh_open_pull_requests(repo).await?;
        let tally = OpenItemsTally {
            issues,
            pull_requests,
            review_requests,
        };

        debug!(
            "Refreshed {} open issues and {} open pull requests in {}",
            tally.issues, tally.pull_requests, repo.name_with_owner
        );
        Ok(tally)
    }

    async fn refresh_open_issues(&self, repo: &RepositoryNode) -> Result<usize> {
        let query = queries::open_issues();
        let (owner, name) = owner_and_name(repo);
        let mut refreshed = 0;
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let data: OpenIssuesData = self
                .executor
                .execute(
                    &query,
                    json!({
                        "owner": owner,
                        "name": name,
                        "cursor": cursor,
                        "pageSize": self.settings.page_size,
                    }),
                    ExecuteOptions::new(format!("open issues of {} page {}", repo.name_with_owner, page)),
                )
                .await?;

            let Some(repository) = data.repository else {
                warn!("Repository {} disappeared while paging open issues", repo.name_with_owner);
                break;
            };

            for issue in repository.issues.items() {
                self.sync_assignees(&issue.id, &issue.assignees)?;
                refreshed += 1;
            }

            match repository.issues.next_cursor() {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok(refreshed)
    }

    async fn refresh_open_pull_requests(
        &self,
        repo: &RepositoryNode,
    ) -> Result<(usize, ReviewRequestDelta)> {
        let query = queries::open_pull_requests();
        let (owner, name) = owner_and_name(repo);
        let mut refreshed = 0;
        let mut delta = ReviewRequestDelta::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let data: OpenPullRequestsData = self
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
                        "open pull requests of {} page {}",
                        repo.name_with_owner, page
                    )),
                )
                .await?;

            let Some(repository) = data.repository else {
                warn!(
                    "Repository {} disappeared while paging open pull requests",
                    repo.name_with_owner
                );
                break;
            };
            let connection = repository.pull_requests;

            let ids: Vec<String> = connection.items().map(|n| n.id.clone()).collect();
            let pending = self
                .store
                .list_pending_review_requests(&ids)
                .context("Failed to load pending review requests")?;

            for pr in connection.items() {
                self.sync_assignees(&pr.id, &pr.assignees)?;

                let live: Vec<ReviewRequestNode> = pr.review_requests.items().cloned().collect();
                let changes = reconcile_review_requests(
                    self.store(),
                    &pr.id,
                    &live,
                    pending.get(&pr.id).map(Vec::as_slice).unwrap_or_default(),
                    Utc::now(),
                )?;
                delta.merge(changes);
                refreshed += 1;
            }

            match connection.next_cursor() {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok((refreshed, delta))
    }
}
