use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::{label_names, owner_and_name, CommentScope, CommentsAccumulator, Collector};
use crate::executor::ExecuteOptions;
use crate::graphql::{queries, IssueNode, ProjectItemNode, RepoIssuesData, RepositoryNode};
use crate::model::{IssueKind, IssueRecord, SubjectType, Tally};
use crate::reconcile::project_history::{self, LiveMembership, HISTORY_KEY};
use crate::window::{evaluate, parse_timestamp, WindowBounds};

/// Drop the embedded repository; it is stored as its own row.
pub(crate) fn strip_repository(raw: &mut Value) {
    if let Value::Object(map) = raw {
        map.remove("repository");
    }
}

impl Collector {
    /// Collect issues of one repository, newest first, and their comments.
    pub async fn collect_issues(
        &self,
        repo: &RepositoryNode,
        bounds: &WindowBounds,
        comment_bounds: &WindowBounds,
        comments: &mut CommentsAccumulator,
    ) -> Result<Tally> {
        let query = queries::issues();
        let (owner, name) = owner_and_name(repo);
        let mut tally = Tally::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let data: RepoIssuesData = self
                .executor
                .execute(
                    &query,
                    json!({
                        "owner": owner,
                        "name": name,
                        "cursor": cursor,
                        "pageSize": self.settings.page_size,
                        "statusField": self.settings.status_field,
                    }),
                    ExecuteOptions::new(format!("issues of {} page {}", repo.name_with_owner, page)),
                )
                .await?;

            let Some(repository) = data.repository else {
                warn!("Repository {} disappeared while paging issues", repo.name_with_owner);
                break;
            };
            let connection = repository.issues;
            let next = connection.next_cursor();
            let nodes = connection.into_items();

            let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
            let previous = self
                .store
                .fetch_issue_raw_map(&ids)
                .context("Failed to load stored issues")?;

            let mut reached_lower_bound = false;
            for issue in &nodes {
                let decision = evaluate(issue.updated_at.as_deref(), bounds);
                if decision.before_lower_bound {
                    reached_lower_bound = true;
                    break;
                }
                if !decision.include {
                    continue;
                }

                if tally.count == 0 {
                    self.ensure_repository(repo)?;
                }
                let comment_tally = self
                    .process_issue(&repo.id, issue, previous.get(&issue.id), comment_bounds)
                    .await?;
                comments.record(comment_tally);
                tally.observe(issue.updated_at.as_deref().and_then(parse_timestamp));
            }

            if reached_lower_bound {
                debug!(
                    "Issues of {} reached the lower bound on page {}",
                    repo.name_with_owner, page
                );
                break;
            }
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        if tally.count > 0 {
            info!("Synced {} issues from {}", tally.count, repo.name_with_owner);
        }
        Ok(tally)
    }

    /// Reconcile and store one issue, then collect its comments.
    ///
    /// Returns the comment tally.
    pub(crate) async fn process_issue(
        &self,
        repository_id: &str,
        issue: &IssueNode,
        previous_raw: Option<&Value>,
        comment_bounds: &WindowBounds,
    ) -> Result<Tally> {
        let author_id = self.upsert_actor(issue.author.as_ref())?;

        let mut raw = serde_json::to_value(issue).context("Failed to encode issue")?;
        strip_repository(&mut raw);

        let mut entered_target = false;
        match self.settings.target_project.as_deref() {
            Some(target) => {
                let items: Vec<ProjectItemNode> = issue.project_items.items().cloned().collect();
                let event_time = project_history::event_time(issue.updated_at.as_deref(), Utc::now());
                let live = LiveMembership::from_items(&items, target, &event_time);
                let merged = project_history::reconcile(
                    &project_history::previous_history(previous_raw),
                    &live,
                    &event_time,
                );
                if merged.removals > 0 {
                    debug!("Issue {} left {} ({} removals)", issue.id, target, merged.removals);
                }
                merged.apply_to(&mut raw);
                entered_target = merged.entered_target;
            }
            None => {
                if let (Some(history), Value::Object(map)) =
                    (previous_raw.and_then(|r| r.get(HISTORY_KEY)), &mut raw)
                {
                    map.insert(HISTORY_KEY.to_string(), history.clone());
                }
            }
        }

        self.store
            .upsert_issue(&IssueRecord {
                id: issue.id.clone(),
                repository_id: repository_id.to_string(),
                kind: IssueKind::Issue,
                number: issue.number,
                title: issue.title.clone(),
                body: issue.body.clone(),
                state: issue.state.clone(),
                author_id,
                url: issue.url.clone(),
                labels: label_names(&issue.labels),
                created_at: issue.created_at.clone(),
                updated_at: issue.updated_at.clone(),
                closed_at: issue.closed_at.clone(),
                raw,
            })
            .with_context(|| format!("Failed to store issue #{}", issue.number))?;

        if entered_target {
            info!("Issue {} entered the target project, clearing derived state", issue.id);
            self.store.clear_activity_statuses(&issue.id)?;
            self.store.clear_project_field_overrides(&issue.id)?;
        }

        self.sync_assignees(&issue.id, &issue.assignees)?;
        self.upsert_reactions(&issue.id, SubjectType::Issue, &issue.reactions)?;

        let mut seen = HashSet::new();
        self.collect_comments(
            CommentScope::new(&issue.id, SubjectType::Issue),
            comment_bounds,
            &mut seen,
        )
        .await
    }
}
