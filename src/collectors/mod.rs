//! Per-resource collectors
//!
//! Each collector pages one upstream connection through the
//! [`RequestExecutor`], applies the sync window and writes normalized
//! entities to the [`MirrorStore`]. Collectors return a [`Tally`] whose
//! `latest` is the candidate watermark for their resource.
//!
//! Top-level connections (issues, discussions, pull requests) are ordered
//! newest-first and stop paging at the first node older than the window.
//! Child connections (comments, reviews) are oldest-first and only skip
//! nodes.

mod comments;
mod discussions;
mod issues;
mod open_items;
mod pull_requests;
mod repositories;

pub use comments::CommentScope;
pub use open_items::OpenItemsTally;
pub use pull_requests::{PullRequestTally, ReviewTally};
pub use repositories::{repository_record, RepositoryPass};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::executor::RequestExecutor;
use crate::graphql::{Actor, Connection, ReactionNode, RepositoryNode};
use crate::model::{ReactionRecord, ResourceKind, SubjectType, Tally};
use crate::store::MirrorStore;
use crate::window::WindowBounds;

/// Knobs shared by every collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSettings {
    pub page_size: u32,
    /// Project field holding the status label
    pub status_field: String,
    /// Project board whose status transitions are recorded
    pub target_project: Option<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            status_field: "Status".to_string(),
            target_project: None,
        }
    }
}

impl CollectorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.sync.page_size,
            status_field: config.sync.status_field.clone(),
            target_project: config
                .sync
                .target_project
                .clone()
                .filter(|t| !t.trim().is_empty()),
        }
    }
}

/// Lower and upper bounds for one orchestrator run
///
/// A per-resource override replaces the global `since` for that resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub overrides: HashMap<ResourceKind, DateTime<Utc>>,
}

impl SyncWindow {
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self {
            since,
            until,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, resource: ResourceKind, since: DateTime<Utc>) -> Self {
        self.overrides.insert(resource, since);
        self
    }

    /// Window whose per-resource lower bounds are the stored watermarks.
    pub fn from_store(
        store: &dyn MirrorStore,
        scope_key: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let mut window = Self::new(since, until);
        for resource in ResourceKind::WATERMARKED {
            if let Some(watermark) = store
                .sync_state(resource, scope_key)
                .with_context(|| format!("Failed to load {} watermark", resource.as_str()))?
            {
                debug!("{} resumes from {}", resource.as_str(), watermark);
                window.overrides.insert(resource, watermark);
            }
        }
        Ok(window)
    }

    pub fn bounds_for(&self, resource: ResourceKind) -> WindowBounds {
        WindowBounds::new(
            self.overrides.get(&resource).copied().or(self.since),
            self.until,
        )
    }
}

/// The cross-cutting comments aggregate
///
/// Issue, discussion and pull-request passes all collect comments; their
/// tallies are folded in here and the comments watermark is taken from the
/// finalized total.
#[derive(Debug, Default)]
pub struct CommentsAccumulator {
    tally: Tally,
    parents: usize,
}

impl CommentsAccumulator {
    pub fn record(&mut self, tally: Tally) {
        self.parents += 1;
        self.tally.merge(tally);
    }

    pub fn parents(&self) -> usize {
        self.parents
    }

    pub fn finalize(self) -> Tally {
        self.tally
    }
}

/// Pages upstream connections into the mirror store
#[derive(Clone)]
pub struct Collector {
    executor: RequestExecutor,
    store: Arc<dyn MirrorStore>,
    settings: CollectorSettings,
}

impl Collector {
    pub fn new(executor: RequestExecutor, store: Arc<dyn MirrorStore>, settings: CollectorSettings) -> Self {
        Self {
            executor,
            store,
            settings,
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn store(&self) -> &dyn MirrorStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Upsert an actor and return its id, if it has one.
    fn upsert_actor(&self, actor: Option<&Actor>) -> Result<Option<String>> {
        let Some(record) = actor.and_then(Actor::to_record) else {
            return Ok(None);
        };
        self.store
            .upsert_user(&record)
            .with_context(|| format!("Failed to store user {}", record.login))?;
        Ok(Some(record.id))
    }

    /// Upsert every assignee and replace the item's assignee set.
    fn sync_assignees(&self, item_id: &str, assignees: &Connection<Actor>) -> Result<usize> {
        let mut ids = Vec::new();
        for assignee in assignees.items() {
            if let Some(id) = self.upsert_actor(Some(assignee))? {
                ids.push(id);
            }
        }
        self.store
            .replace_assignees(item_id, &ids)
            .with_context(|| format!("Failed to store assignees of {}", item_id))?;
        Ok(ids.len())
    }

    fn upsert_reactions(
        &self,
        subject_id: &str,
        subject_type: SubjectType,
        reactions: &Connection<ReactionNode>,
    ) -> Result<usize> {
        let mut stored = 0;
        for reaction in reactions.items() {
            let user_id = self.upsert_actor(reaction.user.as_ref())?;
            self.store
                .upsert_reaction(&ReactionRecord {
                    id: reaction.id.clone(),
                    subject_id: subject_id.to_string(),
                    subject_type,
                    user_id,
                    content: reaction.content.clone(),
                    created_at: reaction.created_at.clone(),
                    raw: serde_json::to_value(reaction).context("Failed to encode reaction")?,
                })
                .with_context(|| format!("Failed to store reaction {}", reaction.id))?;
            stored += 1;
        }
        Ok(stored)
    }
}

/// Owner and name for repository-scoped queries.
pub(crate) fn owner_and_name(repo: &RepositoryNode) -> (&str, &str) {
    match repo.name_with_owner.split_once('/') {
        Some((owner, _)) => (owner, repo.name.as_str()),
        None => (repo.name_with_owner.as_str(), repo.name.as_str()),
    }
}

pub(crate) fn label_names(labels: &Connection<crate::graphql::Label>) -> Vec<String> {
    labels.items().map(|l| l.name.clone()).collect()
}
