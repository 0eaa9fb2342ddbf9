//! orgmirror - Incremental GitHub organization mirror
//!
//! orgmirror pulls an organization's repositories, issues, discussions, pull
//! requests, reviews, comments, reactions and review requests through the
//! GraphQL API into a local SQLite store, one resource type at a time.
//!
//! ## Core Features
//!
//! - **Incremental sync**: per-resource watermarks bound every run
//! - **Rate-limit aware**: exponential backoff plus provider-driven waits
//! - **Reconciliation**: infers withdrawn review requests and project removals
//! - **Targeted resync**: repairs a single node by global id
//!
//! ## Modules
//!
//! - [`executor`]: retrying GraphQL request executor
//! - [`window`]: `[since, until)` window evaluation
//! - [`collectors`]: per-resource collectors
//! - [`reconcile`]: project-history and review-request reconciliation
//! - [`sync`]: the orchestrator
//! - [`store`]: persistence contract and its SQLite implementation

pub mod collectors;
pub mod config;
pub mod error;
pub mod executor;
pub mod github;
pub mod graphql;
pub mod model;
pub mod reconcile;
pub mod resync;
pub mod store;
pub mod sync;
pub mod transport;
pub mod window;

pub use collectors::{Collector, CollectorSettings, SyncWindow};
pub use config::Config;
pub use error::SyncError;
pub use executor::{ExecuteOptions, RequestExecutor};
pub use github::GitHubClient;
pub use resync::ResyncOutcome;
pub use store::{MirrorStore, SqliteStore};
pub use sync::{SyncEngine, SyncSummary};
pub use transport::{GraphqlTransport, HttpTransport};
