//! Shared fixtures for integration tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use orgmirror::graphql::RepositoryNode;
use orgmirror::transport::{GraphqlRequest, GraphqlTransport, TransportResponse};
use orgmirror::{Config, MirrorStore, RequestExecutor, SqliteStore, SyncEngine};

pub const ORG: &str = "acme";

/// Transport that answers from per-operation queues
///
/// Responses can be queued for an operation name, or for an operation
/// name plus the `id` variable. Unscripted calls get an empty page.
#[derive(Default)]
pub struct ScriptedTransport {
    queues: Mutex<HashMap<String, VecDeque<TransportResponse>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, operation: &str, response: TransportResponse) {
        self.push(operation.to_string(), response);
    }

    pub fn script_data(&self, operation: &str, data: Value) {
        self.script(operation, TransportResponse::ok(json!({ "data": data })));
    }

    pub fn script_for(&self, operation: &str, id: &str, data: Value) {
        self.push(
            format!("{}:{}", operation, id),
            TransportResponse::ok(json!({ "data": data })),
        );
    }

    pub fn script_response_for(&self, operation: &str, id: &str, response: TransportResponse) {
        self.push(format!("{}:{}", operation, id), response);
    }

    fn push(&self, key: String, response: TransportResponse) {
        self.queues
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(response);
    }

    /// Number of calls made for an operation
    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .count()
    }

    /// Variables of every call made for an operation, in order
    pub fn variables(&self, operation: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, vars)| vars.clone())
            .collect()
    }

    fn next(&self, operation: &str, id: Option<&str>) -> Option<TransportResponse> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(id) = id {
            if let Some(response) = queues
                .get_mut(&format!("{}:{}", operation, id))
                .and_then(VecDeque::pop_front)
            {
                return Some(response);
            }
        }
        queues.get_mut(operation).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl GraphqlTransport for ScriptedTransport {
    async fn send(&self, request: &GraphqlRequest) -> Result<TransportResponse> {
        let operation = request.operation_name().unwrap_or_default().to_string();
        self.calls
            .lock()
            .unwrap()
            .push((operation.clone(), request.variables.clone()));

        let id = request.variables.get("id").and_then(Value::as_str);
        Ok(self
            .next(&operation, id)
            .unwrap_or_else(|| TransportResponse::ok(json!({ "data": empty_data(&operation) }))))
    }
}

fn empty_data(operation: &str) -> Value {
    let empty = page(vec![], None);
    match operation {
        "OrgRepositories" => json!({ "organization": { "repositories": empty } }),
        "RepoIssues" | "OpenIssues" => json!({ "repository": { "issues": empty } }),
        "RepoDiscussions" => json!({ "repository": { "discussions": empty } }),
        "RepoPullRequests" | "OpenPullRequests" => {
            json!({ "repository": { "pullRequests": empty } })
        }
        "NodeComments" => json!({ "node": { "__typename": "Issue", "comments": empty } }),
        "PullRequestReviews" => {
            json!({ "node": { "__typename": "PullRequest", "reviews": empty } })
        }
        _ => json!({ "node": null }),
    }
}

/// A connection page
pub fn page(nodes: Vec<Value>, next_cursor: Option<&str>) -> Value {
    json!({
        "pageInfo": { "hasNextPage": next_cursor.is_some(), "endCursor": next_cursor },
        "nodes": nodes,
    })
}

pub fn not_found() -> TransportResponse {
    TransportResponse::ok(json!({
        "data": { "node": null },
        "errors": [{ "type": "NOT_FOUND", "message": "Could not resolve to a node" }]
    }))
}

pub fn user(login: &str) -> Value {
    json!({
        "__typename": "User",
        "id": format!("U_{}", login),
        "login": login,
        "name": null,
        "avatarUrl": format!("https://avatars.example/{}", login),
    })
}

pub fn repo(name: &str, updated_at: &str) -> Value {
    json!({
        "id": format!("R_{}", name),
        "name": name,
        "nameWithOwner": format!("{}/{}", ORG, name),
        "url": format!("https://github.com/{}/{}", ORG, name),
        "isPrivate": false,
        "isArchived": false,
        "updatedAt": updated_at,
    })
}

pub fn repo_node(name: &str, updated_at: &str) -> RepositoryNode {
    serde_json::from_value(repo(name, updated_at)).unwrap()
}

pub fn issue(id: &str, number: i64, updated_at: &str) -> Value {
    json!({
        "id": id,
        "number": number,
        "title": format!("Issue {}", number),
        "body": "Something is off",
        "state": "OPEN",
        "url": format!("https://github.com/{}/api/issues/{}", ORG, number),
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": updated_at,
        "closedAt": null,
        "author": user("octo"),
        "assignees": { "nodes": [user("alice")] },
        "labels": { "nodes": [{ "name": "bug" }] },
        "reactions": { "nodes": [] },
        "projectItems": { "nodes": [] },
    })
}

/// A project item on `project` with a single-select status
pub fn project_item(id: &str, project: &str, status: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "updatedAt": updated_at,
        "project": { "title": project },
        "status": {
            "__typename": "ProjectV2ItemFieldSingleSelectValue",
            "name": status,
            "updatedAt": updated_at,
        },
    })
}

pub fn pull_request(id: &str, number: i64, updated_at: &str, reviewers: &[&str]) -> Value {
    let requests: Vec<Value> = reviewers
        .iter()
        .map(|login| json!({ "id": format!("RR_{}_{}", id, login), "requestedReviewer": user(login) }))
        .collect();
    json!({
        "id": id,
        "number": number,
        "title": format!("Change {}", number),
        "body": null,
        "state": "OPEN",
        "url": format!("https://github.com/{}/api/pull/{}", ORG, number),
        "isDraft": false,
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": updated_at,
        "closedAt": null,
        "mergedAt": null,
        "author": user("octo"),
        "assignees": { "nodes": [] },
        "labels": { "nodes": [] },
        "reactions": { "nodes": [] },
        "reviewRequests": { "nodes": requests },
    })
}

pub fn open_pull_request(id: &str, number: i64, reviewers: &[&str]) -> Value {
    let requests: Vec<Value> = reviewers
        .iter()
        .map(|login| json!({ "id": format!("RR_{}_{}", id, login), "requestedReviewer": user(login) }))
        .collect();
    json!({
        "id": id,
        "number": number,
        "updatedAt": "2024-05-20T00:00:00Z",
        "assignees": { "nodes": [] },
        "reviewRequests": { "nodes": requests },
    })
}

pub fn comment(id: &str, updated_at: &str) -> Value {
    json!({
        "__typename": "IssueComment",
        "id": id,
        "body": format!("comment {}", id),
        "url": null,
        "createdAt": updated_at,
        "updatedAt": updated_at,
        "author": user("octo"),
        "reactions": { "nodes": [] },
    })
}

pub fn review(id: &str, submitted_at: &str) -> Value {
    json!({
        "id": id,
        "state": "APPROVED",
        "body": "LGTM",
        "url": null,
        "submittedAt": submitted_at,
        "createdAt": submitted_at,
        "updatedAt": null,
        "author": user("bob"),
        "reactions": { "nodes": [] },
    })
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.github.organization = ORG.to_string();
    config.github.exclude_patterns = vec!["archived-*".to_string()];
    config.sync.page_size = 2;
    config
}

/// Engine over a scripted transport and an in-memory store
pub fn engine(transport: Arc<ScriptedTransport>) -> (SyncEngine, Arc<SqliteStore>) {
    engine_with(transport, test_config())
}

pub fn engine_with(transport: Arc<ScriptedTransport>, config: Config) -> (SyncEngine, Arc<SqliteStore>) {
    engine_over(transport, config, SqliteStore::open_in_memory().unwrap())
}

/// Engine over a database file, so tests can also open it directly
pub fn engine_at(
    transport: Arc<ScriptedTransport>,
    config: Config,
    path: &Path,
) -> (SyncEngine, Arc<SqliteStore>) {
    engine_over(transport, config, SqliteStore::open_at(path).unwrap())
}

fn engine_over(
    transport: Arc<ScriptedTransport>,
    config: Config,
    store: SqliteStore,
) -> (SyncEngine, Arc<SqliteStore>) {
    let store = Arc::new(store);
    let executor = RequestExecutor::new(transport);
    let shared: Arc<dyn MirrorStore> = store.clone();
    (SyncEngine::new(config, executor, shared), store)
}
