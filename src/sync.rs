//! Sync Engine - Orchestrates one incremental mirror run
//!
//! This module sequences the collectors across every repository of the
//! organization:
//! repositories, issues, discussions, pull requests (with reviews), then the
//! shared comments aggregate and the open-item metadata refresh.
//!
//! Each resource type gets its own sync run record. A watermark is persisted
//! only after its resource type finished for every repository; a failure
//! marks the affected runs failed and aborts the remaining sequence without
//! undoing earlier resource types.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::collectors::{
    Collector, CollectorSettings, CommentsAccumulator, OpenItemsTally, PullRequestTally,
    RepositoryPass, SyncWindow,
};
use crate::config::{parse_bound, Config};
use crate::error::SyncError;
use crate::executor::RequestExecutor;
use crate::model::{format_timestamp, ResourceKind, SyncRunStatus, Tally};
use crate::reconcile::ReviewRequestDelta;
use crate::store::MirrorStore;

/// Count and newest timestamp for one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSummary {
    pub resource: ResourceKind,
    pub count: usize,
    pub latest: Option<DateTime<Utc>>,
}

/// Results from a complete sync operation
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub organization: String,
    pub repositories_processed: usize,
    pub resources: Vec<ResourceSummary>,
    pub new_reviews: usize,
    pub open_items: OpenItemsTally,
    pub review_requests: ReviewRequestDelta,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn resource(&self, resource: ResourceKind) -> Option<&ResourceSummary> {
        self.resources.iter().find(|r| r.resource == resource)
    }

    pub fn count(&self, resource: ResourceKind) -> usize {
        self.resource(resource).map_or(0, |r| r.count)
    }

    pub fn latest(&self, resource: ResourceKind) -> Option<DateTime<Utc>> {
        self.resource(resource).and_then(|r| r.latest)
    }
}

/// The orchestrator
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<Config>,
    collector: Collector,
    store: Arc<dyn MirrorStore>,
}

impl SyncEngine {
    /// Create a new sync engine over an executor and a store
    pub fn new(config: Config, executor: RequestExecutor, store: Arc<dyn MirrorStore>) -> Self {
        let collector = Collector::new(
            executor,
            Arc::clone(&store),
            CollectorSettings::from_config(&config),
        );
        Self {
            config: Arc::new(config),
            collector,
            store,
        }
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn organization(&self) -> &str {
        &self.config.github.organization
    }

    /// Window for the next run.
    ///
    /// An explicit `since` (the `--since` flag) or `full` ignores stored
    /// watermarks. Otherwise each resource resumes from its watermark and
    /// the configured `sync.since` covers resources that have none.
    pub fn window(&self, full: bool, since: Option<&str>) -> Result<SyncWindow> {
        let until = self.config.until()?;
        if let Some(since) = parse_bound("--since", since)? {
            if let Some(until) = until {
                if since >= until {
                    return Err(SyncError::validation(format!(
                        "--since ({}) must be earlier than sync.until ({})",
                        since, until
                    ))
                    .into());
                }
            }
            return Ok(SyncWindow::new(Some(since), until));
        }

        let fallback = self.config.since()?;
        if full {
            return Ok(SyncWindow::new(fallback, until));
        }
        SyncWindow::from_store(self.store.as_ref(), self.organization(), fallback, until)
    }

    /// Run every resource pass in order
    pub async fn run_sync(&self, window: &SyncWindow) -> Result<SyncSummary> {
        self.config.validate()?;

        let start_time = Instant::now();
        let org = self.organization().to_string();
        info!("Starting sync of organization {}", org);

        // Repositories
        let repo_run = self.begin(ResourceKind::Repositories, None)?;
        let repositories = self.settle(
            &[repo_run],
            self.collector
                .collect_repositories(
                    &org,
                    &window.bounds_for(ResourceKind::Repositories),
                    |name| self.config.is_excluded(name),
                )
                .await,
        )?;
        self.complete(repo_run, ResourceKind::Repositories, &repositories.tally)?;

        let parent = Some(repo_run);
        let comments_run = self.begin(ResourceKind::Comments, parent)?;
        let mut comments = CommentsAccumulator::default();

        // Issues
        let issues_run = self.begin(ResourceKind::Issues, parent)?;
        let issues = self.settle(
            &[issues_run, comments_run],
            self.issues_pass(&repositories, window, &mut comments).await,
        )?;
        self.complete(issues_run, ResourceKind::Issues, &issues)?;

        // Discussions
        let discussions_run = self.begin(ResourceKind::Discussions, parent)?;
        let discussions = self.settle(
            &[discussions_run, comments_run],
            self.discussions_pass(&repositories, window, &mut comments).await,
        )?;
        self.complete(discussions_run, ResourceKind::Discussions, &discussions)?;

        // Pull requests and reviews
        let pulls_run = self.begin(ResourceKind::PullRequests, parent)?;
        let reviews_run = self.begin(ResourceKind::Reviews, parent)?;
        let pulls = self.settle(
            &[pulls_run, reviews_run, comments_run],
            self.pull_requests_pass(&repositories, window, &mut comments).await,
        )?;
        self.complete(pulls_run, ResourceKind::PullRequests, &pulls.pull_requests)?;
        self.complete(reviews_run, ResourceKind::Reviews, &pulls.reviews.tally)?;

        let comment_parents = comments.parents();
        let comments = comments.finalize();
        self.complete(comments_run, ResourceKind::Comments, &comments)?;
        info!(
            "Collected {} comments across {} parents",
            comments.count, comment_parents
        );

        // Open-item metadata
        let open_run = self.begin(ResourceKind::OpenItems, parent)?;
        let open_items = self.settle(&[open_run], self.open_items_pass(&repositories).await)?;
        self.store.update_sync_log(
            open_run,
            SyncRunStatus::Success,
            Some(&format!(
                "{} open issues, {} open pull requests",
                open_items.issues, open_items.pull_requests
            )),
        )?;

        let mut review_requests = pulls.review_requests;
        review_requests.merge(open_items.review_requests);

        let summary = SyncSummary {
            organization: org,
            repositories_processed: repositories.active().count(),
            resources: vec![
                resource_summary(ResourceKind::Repositories, &repositories.tally),
                resource_summary(ResourceKind::Issues, &issues),
                resource_summary(ResourceKind::Discussions, &discussions),
                resource_summary(ResourceKind::PullRequests, &pulls.pull_requests),
                resource_summary(ResourceKind::Reviews, &pulls.reviews.tally),
                resource_summary(ResourceKind::Comments, &comments),
            ],
            new_reviews: pulls.reviews.new_reviews,
            open_items,
            review_requests,
            duration: start_time.elapsed(),
        };

        info!(
            "Sync completed in {:.2}s: {} repositories, {} issues, {} discussions, {} pull requests, {} comments",
            summary.duration.as_secs_f64(),
            summary.repositories_processed,
            summary.count(ResourceKind::Issues),
            summary.count(ResourceKind::Discussions),
            summary.count(ResourceKind::PullRequests),
            summary.count(ResourceKind::Comments),
        );

        Ok(summary)
    }

    async fn issues_pass(
        &self,
        repositories: &RepositoryPass,
        window: &SyncWindow,
        comments: &mut CommentsAccumulator,
    ) -> Result<Tally> {
        let bounds = window.bounds_for(ResourceKind::Issues);
        let comment_bounds = window.bounds_for(ResourceKind::Comments);
        let mut total = Tally::default();
        for repo in repositories.active() {
            let tally = self
                .collector
                .collect_issues(repo, &bounds, &comment_bounds, comments)
                .await
                .with_context(|| format!("Failed to sync issues of {}", repo.name_with_owner))?;
            total.merge(tally);
        }
        Ok(total)
    }

    async fn discussions_pass(
        &self,
        repositories: &RepositoryPass,
        window: &SyncWindow,
        comments: &mut CommentsAccumulator,
    ) -> Result<Tally> {
        let bounds = window.bounds_for(ResourceKind::Discussions);
        let comment_bounds = window.bounds_for(ResourceKind::Comments);
        let mut total = Tally::default();
        for repo in repositories.active() {
            let tally = self
                .collector
                .collect_discussions(repo, &bounds, &comment_bounds, comments)
                .await
                .with_context(|| {
                    format!("Failed to sync discussions of {}", repo.name_with_owner)
                })?;
            total.merge(tally);
        }
        Ok(total)
    }

    async fn pull_requests_pass(
        &self,
        repositories: &RepositoryPass,
        window: &SyncWindow,
        comments: &mut CommentsAccumulator,
    ) -> Result<PullRequestTally> {
        let bounds = window.bounds_for(ResourceKind::PullRequests);
        let review_bounds = window.bounds_for(ResourceKind::Reviews);
        let comment_bounds = window.bounds_for(ResourceKind::Comments);
        let mut total = PullRequestTally::default();
        for repo in repositories.active() {
            let tally = self
                .collector
                .collect_pull_requests(repo, &bounds, &review_bounds, &comment_bounds, comments)
                .await
                .with_context(|| {
                    format!("Failed to sync pull requests of {}", repo.name_with_owner)
                })?;
            total.merge(tally);
        }
        Ok(total)
    }

    async fn open_items_pass(&self, repositories: &RepositoryPass) -> Result<OpenItemsTally> {
        let mut total = OpenItemsTally::default();
        for repo in repositories.active() {
            let tally = self
                .collector
                .refresh_open_items(repo)
                .await
                .with_context(|| {
                    format!("Failed to refresh open items of {}", repo.name_with_owner)
                })?;
            total.merge(tally);
        }
        Ok(total)
    }

    fn begin(&self, resource: ResourceKind, parent: Option<i64>) -> Result<i64> {
        self.store
            .record_sync_log(resource, SyncRunStatus::Running, None, parent)
            .with_context(|| format!("Failed to start {} run", resource.as_str()))
    }

    /// Persist the watermark and mark the run successful.
    fn complete(&self, run_id: i64, resource: ResourceKind, tally: &Tally) -> Result<()> {
        if let Some(latest) = tally.latest {
            self.store
                .update_sync_state(resource, self.organization(), latest)
                .with_context(|| format!("Failed to persist {} watermark", resource.as_str()))?;
        }

        let message = match tally.latest {
            Some(latest) => format!("{} synced, latest {}", tally.count, format_timestamp(latest)),
            None => format!("{} synced", tally.count),
        };
        self.store
            .update_sync_log(run_id, SyncRunStatus::Success, Some(&message))?;

        info!("{} pass finished: {}", resource.as_str(), message);
        Ok(())
    }

    /// Mark every run in `runs` failed when `result` is an error.
    fn settle<T>(&self, runs: &[i64], result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let message = format!("{:#}", err);
        error!("Sync failed: {}", message);
        for run_id in runs {
            if let Err(log_err) = self
                .store
                .update_sync_log(*run_id, SyncRunStatus::Failed, Some(&message))
            {
                warn!("Could not mark sync run {} failed: {:#}", run_id, log_err);
            }
        }
        Err(err)
    }
}

fn resource_summary(resource: ResourceKind, tally: &Tally) -> ResourceSummary {
    ResourceSummary {
        resource,
        count: tally.count,
        latest: tally.latest,
    }
}
