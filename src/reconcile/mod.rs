//! Reconciliation of freshly fetched nodes against persisted state
//!
//! The upstream API never reports an item leaving a project board or a
//! review request being withdrawn. Both are inferred here by diffing the
//! live snapshot against what the store saw last time.

pub mod project_history;
pub mod review_requests;

pub use project_history::{HistoryEntry, HistoryReconciliation, LiveMembership, REMOVED_STATUS};
pub use review_requests::{reconcile_review_requests, ReviewRequestDelta};
