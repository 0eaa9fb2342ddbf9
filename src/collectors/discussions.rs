use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::issues::strip_repository;
use super::{label_names, owner_and_name, CommentScope, CommentsAccumulator, Collector};
use crate::executor::ExecuteOptions;
use crate::graphql::{queries, DiscussionNode, RepoDiscussionsData, RepositoryNode};
use crate::model::{IssueKind, IssueRecord, SubjectType, Tally};
use crate::window::{evaluate, parse_timestamp, WindowBounds};

fn discussion_state(node: &DiscussionNode) -> &'static str {
    if node.closed {
        "CLOSED"
    } else {
        "OPEN"
    }
}

impl Collector {
    /// Collect discussions of one repository, newest first, and their comments.
    pub async fn collect_discussions(
        &self,
        repo: &RepositoryNode,
        bounds: &WindowBounds,
        comment_bounds: &WindowBounds,
        comments: &mut CommentsAccumulator,
    ) -> Result<Tally> {
        let query = queries::discussions();
        let (owner, name) = owner_and_name(repo);
        let mut tally = Tally::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let data: RepoDiscussionsData = self
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
                        "discussions of {} page {}",
                        repo.name_with_owner, page
                    )),
                )
                .await?;

            let Some(repository) = data.repository else {
                warn!(
                    "Repository {} disappeared while paging discussions",
                    repo.name_with_owner
                );
                break;
            };
            let connection = repository.discussions;
            let next = connection.next_cursor();

            let mut reached_lower_bound = false;
            for discussion in connection.items() {
                let decision = evaluate(discussion.updated_at.as_deref(), bounds);
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
                    .process_discussion(&repo.id, discussion, comment_bounds)
                    .await?;
                comments.record(comment_tally);
                tally.observe(discussion.updated_at.as_deref().and_then(parse_timestamp));
            }

            if reached_lower_bound {
                debug!(
                    "Discussions of {} reached the lower bound on page {}",
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
            info!("Synced {} discussions from {}", tally.count, repo.name_with_owner);
        }
        Ok(tally)
    }

    /// Store one discussion, its accepted answer and its comments.
    pub(crate) async fn process_discussion(
        &self,
        repository_id: &str,
        discussion: &DiscussionNode,
        comment_bounds: &WindowBounds,
    ) -> Result<Tally> {
        let author_id = self.upsert_actor(discussion.author.as_ref())?;

        let mut raw = serde_json::to_value(discussion).context("Failed to encode discussion")?;
        strip_repository(&mut raw);

        self.store
            .upsert_issue(&IssueRecord {
                id: discussion.id.clone(),
                repository_id: repository_id.to_string(),
                kind: IssueKind::Discussion,
                number: discussion.number,
                title: discussion.title.clone(),
                body: discussion.body.clone(),
                state: discussion_state(discussion).to_string(),
                author_id,
                url: discussion.url.clone(),
                labels: label_names(&discussion.labels),
                created_at: discussion.created_at.clone(),
                updated_at: discussion.updated_at.clone(),
                closed_at: discussion.closed_at.clone(),
                raw,
            })
            .with_context(|| format!("Failed to store discussion #{}", discussion.number))?;

        self.upsert_reactions(&discussion.id, SubjectType::Discussion, &discussion.reactions)?;

        let scope = CommentScope::new(&discussion.id, SubjectType::Discussion);
        let mut seen = HashSet::new();
        let mut tally = Tally::default();

        // the answer also shows up in the comment connection
        if let Some(answer) = &discussion.answer {
            self.store_thread(answer, &scope, true, comment_bounds, &mut seen, &mut tally)
                .await?;
        }

        let rest = self.collect_comments(scope, comment_bounds, &mut seen).await?;
        tally.merge(rest);
        Ok(tally)
    }
}
