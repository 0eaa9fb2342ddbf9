mod common;

use serde_json::json;

use common::*;
use orgmirror::model::{ResourceKind, SyncRunStatus};
use orgmirror::transport::TransportResponse;
use orgmirror::window::parse_timestamp;
use orgmirror::{MirrorStore, SyncWindow};

fn script_first_run(transport: &ScriptedTransport) {
    transport.script_data(
        "OrgRepositories",
        json!({ "organization": { "repositories": page(
            vec![
                repo("api", "2024-05-01T00:00:00Z"),
                repo("archived-site", "2024-05-02T00:00:00Z"),
            ],
            None,
        ) } }),
    );
    transport.script_data(
        "RepoIssues",
        json!({ "repository": { "issues": page(
            vec![
                issue("I_1", 1, "2024-05-10T00:00:00Z"),
                issue("I_2", 2, "2024-04-01T00:00:00Z"),
            ],
            None,
        ) } }),
    );
    transport.script_for(
        "NodeComments",
        "I_1",
        json!({ "node": { "__typename": "Issue", "comments": page(
            vec![comment("C_1", "2024-05-11T00:00:00Z")],
            None,
        ) } }),
    );
    transport.script_data(
        "RepoPullRequests",
        json!({ "repository": { "pullRequests": page(
            vec![pull_request("P_1", 3, "2024-05-05T00:00:00Z", &["bob"])],
            None,
        ) } }),
    );
    transport.script_for(
        "PullRequestReviews",
        "P_1",
        json!({ "node": { "__typename": "PullRequest", "reviews": page(
            vec![review("RV_1", "2024-05-06T00:00:00Z")],
            None,
        ) } }),
    );
}

#[tokio::test]
async fn test_full_run_persists_watermarks() {
    let transport = ScriptedTransport::new();
    script_first_run(&transport);

    let (engine, store) = engine(transport.clone());
    let summary = engine.run_sync(&SyncWindow::default()).await.unwrap();

    assert_eq!(summary.organization, ORG);
    assert_eq!(summary.repositories_processed, 1);
    assert_eq!(summary.count(ResourceKind::Issues), 2);
    assert_eq!(summary.count(ResourceKind::PullRequests), 1);
    assert_eq!(summary.count(ResourceKind::Reviews), 1);
    assert_eq!(summary.count(ResourceKind::Comments), 1);
    assert_eq!(summary.new_reviews, 1);
    assert_eq!(summary.review_requests.added, 1);

    // excluded repositories are never visited
    for vars in transport.variables("RepoIssues") {
        assert_eq!(vars["name"], "api");
    }

    let mark = |resource| store.sync_state(resource, ORG).unwrap();
    assert_eq!(mark(ResourceKind::Repositories), parse_timestamp("2024-05-01T00:00:00Z"));
    assert_eq!(mark(ResourceKind::Issues), parse_timestamp("2024-05-10T00:00:00Z"));
    assert_eq!(mark(ResourceKind::PullRequests), parse_timestamp("2024-05-05T00:00:00Z"));
    assert_eq!(mark(ResourceKind::Reviews), parse_timestamp("2024-05-06T00:00:00Z"));
    assert_eq!(mark(ResourceKind::Comments), parse_timestamp("2024-05-11T00:00:00Z"));
    assert_eq!(mark(ResourceKind::Discussions), None);

    let runs = store.recent_sync_logs(20).unwrap();
    assert_eq!(runs.len(), 7);
    assert!(runs.iter().all(|r| r.status == SyncRunStatus::Success));
    let parent = runs
        .iter()
        .find(|r| r.resource == ResourceKind::Repositories.as_str())
        .unwrap()
        .id;
    assert!(runs
        .iter()
        .filter(|r| r.resource != ResourceKind::Repositories.as_str())
        .all(|r| r.run_id == Some(parent)));
}

#[tokio::test]
async fn test_second_run_resumes_from_watermarks() {
    let transport = ScriptedTransport::new();
    script_first_run(&transport);
    let (engine, store) = engine(transport.clone());
    engine.run_sync(&SyncWindow::default()).await.unwrap();

    // I_2 changed upstream without its timestamp moving
    let mut stale = issue("I_2", 2, "2024-04-01T00:00:00Z");
    stale["title"] = "Renamed".into();
    transport.script_data(
        "OrgRepositories",
        json!({ "organization": { "repositories": page(
            vec![repo("api", "2024-05-01T00:00:00Z")],
            None,
        ) } }),
    );
    transport.script_data(
        "RepoIssues",
        json!({ "repository": { "issues": page(
            vec![issue("I_1", 1, "2024-05-10T00:00:00Z"), stale],
            Some("more"),
        ) } }),
    );

    let window = engine.window(false, None).unwrap();
    assert_eq!(
        window.bounds_for(ResourceKind::Issues).since,
        parse_timestamp("2024-05-10T00:00:00Z")
    );

    let summary = engine.run_sync(&window).await.unwrap();
    assert_eq!(summary.count(ResourceKind::Issues), 1);
    assert_eq!(transport.calls("RepoIssues"), 2);

    let raw = store.raw_payload("issues", "I_2").unwrap().unwrap();
    assert_eq!(raw["title"], "Issue 2");
    assert_eq!(
        store.sync_state(ResourceKind::Issues, ORG).unwrap(),
        parse_timestamp("2024-05-10T00:00:00Z")
    );
}

#[tokio::test]
async fn test_full_window_ignores_watermarks() {
    let transport = ScriptedTransport::new();
    let (engine, store) = engine(transport);
    store
        .update_sync_state(
            ResourceKind::Issues,
            ORG,
            parse_timestamp("2024-05-10T00:00:00Z").unwrap(),
        )
        .unwrap();

    assert!(engine.window(false, None).unwrap().overrides.contains_key(&ResourceKind::Issues));
    assert!(engine.window(true, None).unwrap().overrides.is_empty());
}

#[tokio::test]
async fn test_configured_since_only_fills_missing_watermarks() {
    let transport = ScriptedTransport::new();
    let mut config = test_config();
    config.sync.since = Some("2024-01-01T00:00:00Z".to_string());
    let (engine, store) = engine_with(transport, config);
    store
        .update_sync_state(
            ResourceKind::Issues,
            ORG,
            parse_timestamp("2024-05-10T00:00:00Z").unwrap(),
        )
        .unwrap();

    let window = engine.window(false, None).unwrap();
    assert_eq!(
        window.bounds_for(ResourceKind::Issues).since,
        parse_timestamp("2024-05-10T00:00:00Z")
    );
    assert_eq!(
        window.bounds_for(ResourceKind::Comments).since,
        parse_timestamp("2024-01-01T00:00:00Z")
    );

    let full = engine.window(true, None).unwrap();
    assert_eq!(
        full.bounds_for(ResourceKind::Issues).since,
        parse_timestamp("2024-01-01T00:00:00Z")
    );
}

#[tokio::test]
async fn test_explicit_since_ignores_watermarks() {
    let transport = ScriptedTransport::new();
    let mut config = test_config();
    config.sync.since = Some("2024-01-01T00:00:00Z".to_string());
    config.sync.until = Some("2024-06-01T00:00:00Z".to_string());
    let (engine, store) = engine_with(transport, config);
    store
        .update_sync_state(
            ResourceKind::Issues,
            ORG,
            parse_timestamp("2024-05-10T00:00:00Z").unwrap(),
        )
        .unwrap();

    let window = engine.window(false, Some("2024-03-01T00:00:00Z")).unwrap();
    assert!(window.overrides.is_empty());
    assert_eq!(
        window.bounds_for(ResourceKind::Issues).since,
        parse_timestamp("2024-03-01T00:00:00Z")
    );

    assert!(engine.window(false, Some("yesterday")).is_err());
    assert!(engine.window(false, Some("2024-07-01T00:00:00Z")).is_err());
}

#[tokio::test]
async fn test_items_of_unchanged_repository_get_a_repository_row() {
    let transport = ScriptedTransport::new();
    transport.script_data(
        "OrgRepositories",
        json!({ "organization": { "repositories": page(
            vec![repo("api", "2024-01-01T00:00:00Z")],
            None,
        ) } }),
    );
    transport.script_data(
        "RepoIssues",
        json!({ "repository": { "issues": page(
            vec![issue("I_1", 1, "2024-05-10T00:00:00Z")],
            None,
        ) } }),
    );
    let (engine, store) = engine(transport);

    let window = SyncWindow::new(parse_timestamp("2024-03-01T00:00:00Z"), None);
    let summary = engine.run_sync(&window).await.unwrap();

    assert_eq!(summary.count(ResourceKind::Repositories), 0);
    assert_eq!(summary.count(ResourceKind::Issues), 1);
    assert_eq!(store.count_rows("repositories").unwrap(), 1);
    assert!(store.raw_payload("repositories", "R_api").unwrap().is_some());
    assert_eq!(store.sync_state(ResourceKind::Repositories, ORG).unwrap(), None);
}

#[tokio::test]
async fn test_failure_marks_runs_and_keeps_earlier_watermarks() {
    let transport = ScriptedTransport::new();
    transport.script_data(
        "OrgRepositories",
        json!({ "organization": { "repositories": page(
            vec![repo("api", "2024-05-01T00:00:00Z")],
            None,
        ) } }),
    );
    transport.script_data(
        "RepoIssues",
        json!({ "repository": { "issues": page(
            vec![issue("I_1", 1, "2024-05-10T00:00:00Z")],
            None,
        ) } }),
    );
    transport.script(
        "RepoPullRequests",
        TransportResponse::ok(json!({ "message": "Bad credentials" })).with_status(401),
    );
    let (engine, store) = engine(transport.clone());

    let err = engine.run_sync(&SyncWindow::default()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("pull requests of acme/api"));
    assert_eq!(transport.calls("RepoPullRequests"), 1);

    let runs = store.recent_sync_logs(20).unwrap();
    let status_of = |resource: ResourceKind| {
        runs.iter()
            .find(|r| r.resource == resource.as_str())
            .map(|r| r.status)
    };
    assert_eq!(status_of(ResourceKind::Repositories), Some(SyncRunStatus::Success));
    assert_eq!(status_of(ResourceKind::Issues), Some(SyncRunStatus::Success));
    assert_eq!(status_of(ResourceKind::Discussions), Some(SyncRunStatus::Success));
    assert_eq!(status_of(ResourceKind::PullRequests), Some(SyncRunStatus::Failed));
    assert_eq!(status_of(ResourceKind::Reviews), Some(SyncRunStatus::Failed));
    assert_eq!(status_of(ResourceKind::Comments), Some(SyncRunStatus::Failed));
    assert_eq!(status_of(ResourceKind::OpenItems), None);

    assert_eq!(
        store.sync_state(ResourceKind::Issues, ORG).unwrap(),
        parse_timestamp("2024-05-10T00:00:00Z")
    );
    assert_eq!(store.sync_state(ResourceKind::PullRequests, ORG).unwrap(), None);
    assert_eq!(store.sync_state(ResourceKind::Comments, ORG).unwrap(), None);
}

#[tokio::test]
async fn test_missing_organization_is_rejected() {
    let transport = ScriptedTransport::new();
    let mut config = test_config();
    config.github.organization = String::new();
    let (engine, store) = engine_with(transport.clone(), config);

    assert!(engine.run_sync(&SyncWindow::default()).await.is_err());
    assert_eq!(transport.calls("OrgRepositories"), 0);
    assert_eq!(store.count_rows("sync_log").unwrap(), 0);
}
