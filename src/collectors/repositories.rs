use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Collector;
use crate::error::SyncError;
use crate::executor::ExecuteOptions;
use crate::graphql::{queries, OrgRepositoriesData, RepositoryNode};
use crate::model::{RepositoryRecord, Tally};
use crate::window::{evaluate, parse_timestamp, WindowBounds};

/// Repositories found by one listing pass
#[derive(Debug, Clone, Default)]
pub struct RepositoryPass {
    /// Every listed repository that is not excluded, in listing order.
    pub repositories: Vec<RepositoryNode>,
    /// In-window repositories upserted by this pass.
    pub tally: Tally,
    pub excluded: usize,
}

impl RepositoryPass {
    /// Repositories the item passes visit; archived ones are skipped.
    pub fn active(&self) -> impl Iterator<Item = &RepositoryNode> {
        self.repositories.iter().filter(|r| !r.is_archived)
    }
}

pub fn repository_record(node: &RepositoryNode) -> Result<RepositoryRecord> {
    Ok(RepositoryRecord {
        id: node.id.clone(),
        name: node.name.clone(),
        name_with_owner: node.name_with_owner.clone(),
        url: node.url.clone(),
        is_private: node.is_private,
        is_archived: node.is_archived,
        updated_at: node.updated_at.clone(),
        raw: serde_json::to_value(node).context("Failed to encode repository")?,
    })
}

impl Collector {
    /// Store a repository row without touching the repositories tally.
    ///
    /// Item passes call this before their first stored item, so items of a
    /// repository outside the repositories window still have a parent row.
    pub(crate) fn ensure_repository(&self, repo: &RepositoryNode) -> Result<()> {
        self.store
            .upsert_repository(&repository_record(repo)?)
            .with_context(|| format!("Failed to store repository {}", repo.name_with_owner))
    }

    /// List the organization's repositories.
    ///
    /// In-window repositories are upserted. Every non-excluded repository is
    /// returned so item passes can look for recent activity in repositories
    /// whose own metadata has not changed; those are stored on first use.
    pub async fn collect_repositories(
        &self,
        organization: &str,
        bounds: &WindowBounds,
        is_excluded: impl Fn(&str) -> bool,
    ) -> Result<RepositoryPass> {
        let query = queries::repositories();
        let mut pass = RepositoryPass::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let data: OrgRepositoriesData = self
                .executor
                .execute(
                    &query,
                    json!({
                        "org": organization,
                        "cursor": cursor,
                        "pageSize": self.settings.page_size,
                    }),
                    ExecuteOptions::new(format!("repositories of {} page {}", organization, page)),
                )
                .await?;

            let Some(org) = data.organization else {
                return Err(SyncError::not_found(format!("organization {}", organization)).into());
            };
            let connection = org.repositories;
            let next = connection.next_cursor();

            for repo in connection.into_items() {
                if is_excluded(&repo.name) {
                    debug!("Excluding repository due to pattern match: {}", repo.name);
                    pass.excluded += 1;
                    continue;
                }

                let decision = evaluate(repo.updated_at.as_deref(), bounds);
                if decision.include {
                    self.ensure_repository(&repo)?;
                    pass.tally
                        .observe(repo.updated_at.as_deref().and_then(parse_timestamp));
                } else if repo.updated_at.is_none() {
                    warn!("Repository {} has no update time", repo.name_with_owner);
                }

                pass.repositories.push(repo);
            }

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        info!(
            "Listed {} repositories for {} ({} updated, {} excluded)",
            pass.repositories.len(),
            organization,
            pass.tally.count,
            pass.excluded
        );
        Ok(pass)
    }
}
