use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use tracing::debug;

use crate::graphql::ReviewRequestNode;
use crate::model::{format_timestamp, PendingReviewRequest, ReviewRequestRecord};
use crate::store::MirrorStore;

/// Raw `reason` recorded on requests that disappeared upstream
pub const REMOVED_REASON: &str = "not_observed_live";

/// Raw `reason` recorded on a request replaced by a new request id
pub const SUPERSEDED_REASON: &str = "superseded";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewRequestDelta {
    /// Live requests for reviewers that had no pending request.
    pub added: usize,
    pub removed: usize,
}

impl ReviewRequestDelta {
    pub fn merge(&mut self, other: ReviewRequestDelta) {
        self.added += other.added;
        self.removed += other.removed;
    }
}

/// Bring stored review requests of one pull request in line with the live set.
///
/// Team requests are ignored. Pending requests whose reviewer is no longer
/// requested, or whose reviewer now has a request under another id, are
/// marked removed at `now`.
pub fn reconcile_review_requests(
    store: &dyn MirrorStore,
    pull_request_id: &str,
    live: &[ReviewRequestNode],
    pending: &[PendingReviewRequest],
    now: DateTime<Utc>,
) -> Result<ReviewRequestDelta> {
    let stamp = format_timestamp(now);
    let mut delta = ReviewRequestDelta::default();
    let mut active: HashSet<String> = HashSet::new();

    for request in live {
        let Some(user) = request.requested_reviewer.as_ref().and_then(|r| r.as_user()) else {
            continue;
        };
        let Some(record) = user.to_record() else {
            continue;
        };
        let reviewer_id = record.id.clone();

        store
            .upsert_user(&record)
            .with_context(|| format!("Failed to store reviewer {}", user.login))?;

        let existing = pending.iter().find(|p| p.reviewer_id == reviewer_id);
        if existing.is_none() && !active.contains(&reviewer_id) {
            delta.added += 1;
        }
        if let Some(old) = existing.filter(|p| p.id != request.id) {
            store
                .upsert_review_request(&ReviewRequestRecord {
                    id: old.id.clone(),
                    pull_request_id: old.pull_request_id.clone(),
                    reviewer_id: old.reviewer_id.clone(),
                    requested_at: old.requested_at.clone(),
                    removed_at: Some(stamp.clone()),
                    raw: json!({
                        "reason": SUPERSEDED_REASON,
                        "originalRequestId": old.id,
                        "supersededBy": request.id,
                    }),
                })
                .with_context(|| format!("Failed to retire review request {}", old.id))?;
        }

        store
            .upsert_review_request(&ReviewRequestRecord {
                id: request.id.clone(),
                pull_request_id: pull_request_id.to_string(),
                reviewer_id: reviewer_id.clone(),
                requested_at: existing
                    .map(|p| p.requested_at.clone())
                    .unwrap_or_else(|| stamp.clone()),
                removed_at: None,
                raw: serde_json::to_value(request).context("Failed to encode review request")?,
            })
            .with_context(|| format!("Failed to store review request {}", request.id))?;

        active.insert(reviewer_id);
    }

    for request in pending {
        if active.contains(&request.reviewer_id) {
            continue;
        }

        store
            .upsert_review_request(&ReviewRequestRecord {
                id: request.id.clone(),
                pull_request_id: request.pull_request_id.clone(),
                reviewer_id: request.reviewer_id.clone(),
                requested_at: request.requested_at.clone(),
                removed_at: Some(stamp.clone()),
                raw: json!({
                    "reason": REMOVED_REASON,
                    "originalRequestId": request.id,
                }),
            })
            .with_context(|| format!("Failed to mark review request {} removed", request.id))?;

        debug!(
            "Review request {} on {} no longer live",
            request.id, pull_request_id
        );
        delta.removed += 1;
    }

    Ok(delta)
}
