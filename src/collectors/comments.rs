use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::Collector;
use crate::error::is_not_found;
use crate::executor::ExecuteOptions;
use crate::graphql::{queries, CommentNode, NodeCommentsData};
use crate::model::{CommentRecord, SubjectType, Tally};
use crate::window::{evaluate, parse_timestamp, WindowBounds};

/// The parent whose comment connection is being collected
#[derive(Debug, Clone, Copy)]
pub struct CommentScope<'a> {
    pub subject_id: &'a str,
    pub subject_type: SubjectType,
}

impl<'a> CommentScope<'a> {
    pub fn new(subject_id: &'a str, subject_type: SubjectType) -> Self {
        Self {
            subject_id,
            subject_type,
        }
    }

    /// Review comments fall back to the reviewed parent when upstream omits the link.
    fn review_id(&self, comment: &CommentNode) -> Option<String> {
        comment
            .pull_request_review
            .as_ref()
            .map(|r| r.id.clone())
            .or_else(|| (self.subject_type == SubjectType::Review).then(|| self.subject_id.to_string()))
    }
}

impl Collector {
    /// Page every comment of one parent, oldest first.
    ///
    /// Ids already in `seen` are skipped. A parent that disappeared
    /// upstream ends collection early with whatever was stored so far.
    pub async fn collect_comments(
        &self,
        scope: CommentScope<'_>,
        bounds: &WindowBounds,
        seen: &mut HashSet<String>,
    ) -> Result<Tally> {
        let query = queries::comments();
        let mut tally = Tally::default();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let result: Result<NodeCommentsData> = self
                .executor
                .execute(
                    &query,
                    json!({
                        "id": scope.subject_id,
                        "cursor": cursor,
                        "pageSize": self.settings.page_size,
                    }),
                    ExecuteOptions::new(format!("comments of {} page {}", scope.subject_id, page)),
                )
                .await;

            let data = match result {
                Ok(data) => data,
                Err(err) if is_not_found(&err) => {
                    warn!(
                        "{} {} not found while paging comments, keeping {} collected",
                        scope.subject_type.as_str(),
                        scope.subject_id,
                        tally.count
                    );
                    return Ok(tally);
                }
                Err(err) => return Err(err),
            };

            let Some(holder) = data.node else {
                warn!(
                    "{} {} no longer exists, keeping {} collected comments",
                    scope.subject_type.as_str(),
                    scope.subject_id,
                    tally.count
                );
                return Ok(tally);
            };
            let Some(connection) = holder.comments else {
                debug!("{} {} has no comments", holder.typename, scope.subject_id);
                return Ok(tally);
            };

            for comment in connection.items() {
                self.store_thread(comment, &scope, false, bounds, seen, &mut tally)
                    .await?;
            }

            match connection.next_cursor() {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        debug!(
            "Stored {} comments for {} {}",
            tally.count,
            scope.subject_type.as_str(),
            scope.subject_id
        );
        Ok(tally)
    }

    /// Store a comment and its replies, paging past the nested first page.
    pub(crate) async fn store_thread(
        &self,
        comment: &CommentNode,
        scope: &CommentScope<'_>,
        is_answer: bool,
        bounds: &WindowBounds,
        seen: &mut HashSet<String>,
        tally: &mut Tally,
    ) -> Result<()> {
        let reply_to = comment.reply_to.as_ref().map(|r| r.id.clone());
        self.store_comment(comment, scope, reply_to, is_answer, bounds, seen, tally)?;

        if let Some(replies) = &comment.replies {
            for reply in replies.items() {
                self.store_reply(reply, &comment.id, scope, bounds, seen, tally)?;
            }
            if let Some(cursor) = replies.next_cursor() {
                self.collect_replies(&comment.id, cursor, scope, bounds, seen, tally)
                    .await?;
            }
        }
        Ok(())
    }

    /// Page the replies of one discussion comment, starting after `cursor`.
    async fn collect_replies(
        &self,
        parent_id: &str,
        cursor: String,
        scope: &CommentScope<'_>,
        bounds: &WindowBounds,
        seen: &mut HashSet<String>,
        tally: &mut Tally,
    ) -> Result<()> {
        let query = queries::comments();
        let mut cursor = Some(cursor);
        let mut page = 1u32;

        while let Some(after) = cursor.take() {
            page += 1;
            let result: Result<NodeCommentsData> = self
                .executor
                .execute(
                    &query,
                    json!({
                        "id": parent_id,
                        "cursor": after,
                        "pageSize": self.settings.page_size,
                    }),
                    ExecuteOptions::new(format!("replies to {} page {}", parent_id, page)),
                )
                .await;

            let data = match result {
                Ok(data) => data,
                Err(err) if is_not_found(&err) => {
                    warn!("Comment {} not found while paging replies", parent_id);
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let Some(connection) = data.node.and_then(|holder| holder.comments) else {
                warn!("Comment {} no longer exists, stopping replies", parent_id);
                return Ok(());
            };

            for reply in connection.items() {
                self.store_reply(reply, parent_id, scope, bounds, seen, tally)?;
            }
            cursor = connection.next_cursor();
        }

        debug!("Paged {} reply pages for comment {}", page - 1, parent_id);
        Ok(())
    }

    fn store_reply(
        &self,
        reply: &CommentNode,
        parent_id: &str,
        scope: &CommentScope<'_>,
        bounds: &WindowBounds,
        seen: &mut HashSet<String>,
        tally: &mut Tally,
    ) -> Result<()> {
        let reply_to = reply
            .reply_to
            .as_ref()
            .map(|r| r.id.clone())
            .or_else(|| Some(parent_id.to_string()));
        self.store_comment(reply, scope, reply_to, false, bounds, seen, tally)
    }

    #[allow(clippy::too_many_arguments)]
    fn store_comment(
        &self,
        comment: &CommentNode,
        scope: &CommentScope<'_>,
        reply_to_id: Option<String>,
        is_answer: bool,
        bounds: &WindowBounds,
        seen: &mut HashSet<String>,
        tally: &mut Tally,
    ) -> Result<()> {
        if seen.contains(&comment.id) {
            debug!("Skipping already collected comment {}", comment.id);
            return Ok(());
        }
        if !evaluate(comment.updated_at.as_deref(), bounds).include {
            return Ok(());
        }

        let author_id = self.upsert_actor(comment.author.as_ref())?;

        let mut node = comment.clone();
        node.replies = None;

        self.store
            .upsert_comment(&CommentRecord {
                id: comment.id.clone(),
                subject_id: scope.subject_id.to_string(),
                subject_type: scope.subject_type,
                author_id,
                review_id: scope.review_id(comment),
                reply_to_id,
                is_answer,
                body: comment.body.clone(),
                url: comment.url.clone(),
                created_at: comment.created_at.clone(),
                updated_at: comment.updated_at.clone(),
                raw: serde_json::to_value(&node).context("Failed to encode comment")?,
            })
            .with_context(|| format!("Failed to store comment {}", comment.id))?;

        let reaction_subject = SubjectType::resolve(comment.typename.as_deref(), SubjectType::Comment);
        self.upsert_reactions(&comment.id, reaction_subject, &comment.reactions)?;

        seen.insert(comment.id.clone());
        tally.observe(comment.updated_at.as_deref().and_then(parse_timestamp));
        Ok(())
    }
}
