//! Run lifecycle: high-water marks, terminal status, hooks, single flight and scheduling.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use activity_sync::collector::Collector;
use activity_sync::database::models::{Resource, RunStatus, RunType, SyncStrategy};
use activity_sync::database::queries::Queries;
use activity_sync::database::sync_state::SyncState;
use activity_sync::database::Database;
use activity_sync::github::{GraphError, RateBudget};
use activity_sync::sync::{RefreshHook, RefreshScope, SyncOrchestrator, MAX_SYNC_INTERVAL_MINUTES};
use activity_sync::SyncError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use common::*;

const WIDGETS: &str = "acme/widgets";

fn client_with_widgets() -> MockGraphClient {
    let client = MockGraphClient::new();
    client.add_repository(repository("R_widgets", WIDGETS));
    client
}

#[tokio::test]
async fn test_marker_is_minimum_of_advanced_resources() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z")]);
    client.set_discussions(WIDGETS, vec![discussion("D_1", WIDGETS, 2, "2024-04-01T00:00:00Z")]);
    client.set_pull_requests(WIDGETS, vec![pull_request("PR_1", WIDGETS, 3, "2024-06-01T00:00:00Z")]);
    let engine = setup_engine(client).await;
    let pool = engine.db.pool();

    let summary = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    assert_eq!(summary.last_successful_at, Some(at("2024-04-01T00:00:00Z")));
    assert_eq!(
        SyncState::get_settings(pool, ORG).await.unwrap().unwrap().last_successful_at,
        Some(at("2024-04-01T00:00:00Z"))
    );

    for (resource, expected) in [
        (Resource::Issues, "2024-05-01T00:00:00Z"),
        (Resource::Discussions, "2024-04-01T00:00:00Z"),
        (Resource::PullRequests, "2024-06-01T00:00:00Z"),
    ] {
        let cursor = SyncState::get_cursor(pool, resource).await.unwrap().unwrap();
        assert_eq!(cursor.last_item_at, Some(at(expected)));
    }

    let run = SyncState::get_run(pool, &summary.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.run_type, RunType::Manual);
    assert_eq!(run.strategy, SyncStrategy::Incremental);
    assert!(run.completed_at.is_some());
    assert_eq!(run.summary.unwrap()["counts"]["issues"], 1);
}

#[tokio::test]
async fn test_older_backfill_does_not_move_cursor_back() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_new", WIDGETS, 2, "2024-05-01T00:00:00Z")]);
    let engine = setup_engine(client).await;
    let pool = engine.db.pool();

    engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    engine
        .client
        .set_issues(WIDGETS, vec![issue("I_old", WIDGETS, 1, "2023-06-01T00:00:00Z")]);
    let summary = engine
        .orchestrator
        .run_backfill(at("2023-01-01T00:00:00Z"), Some(at("2024-01-01T00:00:00Z")))
        .await
        .unwrap();

    assert_eq!(summary.strategy, SyncStrategy::Backfill);
    assert_eq!(summary.counts.issues, 1);
    assert!(Queries::get_issue(pool, "I_old").await.unwrap().is_some());

    let cursor = SyncState::get_cursor(pool, Resource::Issues).await.unwrap().unwrap();
    assert_eq!(cursor.last_item_at, Some(at("2024-05-01T00:00:00Z")));
    assert_eq!(
        SyncState::get_settings(pool, ORG).await.unwrap().unwrap().last_successful_at,
        Some(at("2024-05-01T00:00:00Z"))
    );
}

#[tokio::test]
async fn test_backfill_without_prior_coverage_leaves_cursor() {
    let client = client_with_widgets();
    client.set_issues(
        WIDGETS,
        vec![
            issue("I_X", WIDGETS, 1, "2024-06-01T00:00:00Z"),
            issue("I_Y", WIDGETS, 2, "2024-07-01T00:00:00Z"),
        ],
    );
    client.set_comments("I_X", vec![comment("IC_june", "2024-06-01T00:00:00Z")]);
    let engine = setup_engine(client).await;
    let pool = engine.db.pool();

    let backfill = engine
        .orchestrator
        .run_backfill(at("2024-01-01T00:00:00Z"), Some(at("2024-03-01T00:00:00Z")))
        .await
        .unwrap();
    assert_eq!(backfill.counts.issues, 2);
    assert_eq!(backfill.counts.comments, 0);
    assert!(SyncState::get_cursor(pool, Resource::Issues).await.unwrap().is_none());
    assert!(backfill.last_successful_at.is_none());

    engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    let comments = Queries::comments_for_issue(pool, "I_X").await.unwrap();
    assert_eq!(comments.len(), 1);
}

#[tokio::test]
async fn test_backfill_caps_cursor_at_window_end() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_A", WIDGETS, 1, "2024-02-15T00:00:00Z")]);
    let engine = setup_engine(client).await;
    let pool = engine.db.pool();

    engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    engine.client.set_issues(
        WIDGETS,
        vec![
            issue("I_A", WIDGETS, 1, "2024-02-15T00:00:00Z"),
            issue("I_Y", WIDGETS, 2, "2024-07-01T00:00:00Z"),
        ],
    );
    engine
        .client
        .set_comments("I_Y", vec![comment("IC_june", "2024-06-01T00:00:00Z")]);

    let backfill = engine
        .orchestrator
        .run_backfill(at("2024-01-01T00:00:00Z"), Some(at("2024-03-01T00:00:00Z")))
        .await
        .unwrap();
    assert_eq!(backfill.counts.comments, 0);

    let cursor = SyncState::get_cursor(pool, Resource::Issues).await.unwrap().unwrap();
    assert_eq!(cursor.last_item_at, Some(at("2024-03-01T00:00:00Z")));
    assert_eq!(backfill.last_successful_at, Some(at("2024-03-01T00:00:00Z")));

    let incremental = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();
    assert_eq!(
        incremental.since_by_resource.get(&Resource::Issues),
        Some(&at("2024-03-01T00:00:00Z"))
    );

    let comments = Queries::comments_for_issue(pool, "I_Y").await.unwrap();
    assert_eq!(comments.len(), 1);
}

#[tokio::test]
async fn test_cursor_records_page_of_newest_item() {
    let client = client_with_widgets();
    client.set_issues(
        WIDGETS,
        vec![
            issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z"),
            issue("I_2", WIDGETS, 2, "2024-04-01T00:00:00Z"),
            issue("I_3", WIDGETS, 3, "2024-03-01T00:00:00Z"),
        ],
    );
    let engine = setup_engine(client).await;

    engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    // Two per page: the newest issue sits on the first page.
    let cursor = SyncState::get_cursor(engine.db.pool(), Resource::Issues)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cursor.cursor.as_deref(), Some("2"));
    assert_eq!(cursor.last_item_at, Some(at("2024-05-01T00:00:00Z")));
}

#[tokio::test]
async fn test_successful_sync_is_followed_by_realignment() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z")]);
    client.set_node("I_1", resolved_issue("I_1", "R_widgets", WIDGETS, 1));
    let mut config = test_config();
    config.realign.after_sync = true;
    let engine = setup_engine_with(client, config).await;

    let summary = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    let realigned = summary.realignment.unwrap();
    assert_eq!(realigned.candidates, 1);
    assert_eq!(realigned.checked, 1);
    assert_eq!(realigned.updated, 0);
    assert!(!engine.realigner.is_running());

    let issue = Queries::get_issue(engine.db.pool(), "I_1").await.unwrap().unwrap();
    assert!(issue.ownership_verified_at.is_some());
    assert_eq!(engine.client.call_count("ItemById"), 1);
}

#[tokio::test]
async fn test_realignment_disabled_after_sync() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z")]);
    let engine = setup_engine(client).await;

    let summary = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    assert!(summary.realignment.is_none());
    assert_eq!(engine.client.call_count("ItemById"), 0);
}

#[tokio::test]
async fn test_failed_run_keeps_marks() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z")]);
    let engine = setup_engine(client).await;
    let pool = engine.db.pool();

    engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    engine.client.set_issues(
        WIDGETS,
        vec![
            issue("I_2", WIDGETS, 2, "2024-05-10T00:00:00Z"),
            issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z"),
        ],
    );
    engine.client.fail(
        "RepositoryPullRequests",
        WIDGETS,
        GraphError::Transport("connection reset".to_string()),
    );

    let err = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::RemoteError(GraphError::Transport(_))));

    // Rows written before the failure stay; the marks do not move past them.
    assert!(Queries::get_issue(pool, "I_2").await.unwrap().is_some());
    let cursor = SyncState::get_cursor(pool, Resource::Issues).await.unwrap().unwrap();
    assert_eq!(cursor.last_item_at, Some(at("2024-05-01T00:00:00Z")));

    let settings = SyncState::get_settings(pool, ORG).await.unwrap().unwrap();
    assert_eq!(settings.last_successful_at, Some(at("2024-05-01T00:00:00Z")));
    assert!(settings.last_completed_at.is_some());

    let runs = Queries::recent_runs(pool, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(runs[1].status, RunStatus::Success);
}

#[tokio::test]
async fn test_since_falls_back_to_initial_lookback() {
    let now = Utc::now();
    let recent = (now - chrono::Duration::days(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let stale = (now - chrono::Duration::days(60)).to_rfc3339_opts(SecondsFormat::Secs, true);

    let client = client_with_widgets();
    client.set_issues(
        WIDGETS,
        vec![issue("I_recent", WIDGETS, 2, &recent), issue("I_stale", WIDGETS, 1, &stale)],
    );
    let config = activity_sync::config::AppConfig {
        initial_lookback_days: Some(30),
        ..test_config()
    };
    let engine = setup_engine_with(client, config).await;

    let summary = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    assert_eq!(summary.since_by_resource.len(), 3);
    assert_eq!(summary.counts.issues, 1);
    assert!(Queries::get_issue(engine.db.pool(), "I_recent").await.unwrap().is_some());
    assert!(Queries::get_issue(engine.db.pool(), "I_stale").await.unwrap().is_none());
}

#[tokio::test]
async fn test_backfill_rejects_empty_range() {
    let engine = setup_engine(client_with_widgets()).await;

    let err = engine
        .orchestrator
        .run_backfill(at("2024-02-01T00:00:00Z"), Some(at("2024-02-01T00:00:00Z")))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ValidationError(_)));
    assert!(Queries::recent_runs(engine.db.pool(), 10).await.unwrap().is_empty());
    assert_eq!(engine.client.total_calls(), 0);
}

/// Records each scope together with the latest run's status at notification time.
struct RecordingHook {
    db: Database,
    seen: Mutex<Vec<(RefreshScope, RunStatus)>>,
}

#[async_trait]
impl RefreshHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    async fn refresh(&self, scope: &RefreshScope) -> Result<(), SyncError> {
        let runs = Queries::recent_runs(self.db.pool(), 1).await?;
        self.seen
            .lock()
            .unwrap()
            .push((scope.clone(), runs[0].status));
        Err(SyncError::TaskError("hook failures are only logged".to_string()))
    }
}

#[tokio::test]
async fn test_hooks_fire_after_terminal_status() {
    let client = Arc::new(client_with_widgets());
    client.set_issues(WIDGETS, vec![issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z")]);
    client.set_discussions(WIDGETS, vec![discussion("D_1", WIDGETS, 2, "2024-05-01T00:00:00Z")]);

    let db = setup_test_db().await;
    let config = test_config();
    let hook = Arc::new(RecordingHook {
        db: db.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let collector = Collector::new(
        db.clone(),
        client.clone(),
        RateBudget::new(),
        config.collector_config(),
    );
    let orchestrator = Arc::new(
        SyncOrchestrator::new(db.clone(), collector, config.orchestrator_config())
            .with_hook(hook.clone()),
    );

    orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();

    client.fail(
        "OrganizationRepositories",
        "*",
        GraphError::Http {
            status: 500,
            message: "oops".to_string(),
        },
    );
    assert!(orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .is_err());

    let seen = hook.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (
                RefreshScope::Targeted(vec!["D_1".to_string(), "I_1".to_string()]),
                RunStatus::Success
            ),
            (RefreshScope::Full, RunStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_requests_join_one_run() {
    let client = client_with_widgets();
    client.set_issues(WIDGETS, vec![issue("I_1", WIDGETS, 1, "2024-05-01T00:00:00Z")]);
    client.set_delay(Duration::from_millis(200));
    let engine = setup_engine(client).await;

    let orchestrator = engine.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.run_incremental_sync(RunType::Manual).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.orchestrator.is_running());

    let joined = engine
        .orchestrator
        .run_incremental_sync(RunType::Automatic)
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(joined.run_id, first.run_id);
    assert_eq!(joined.run_type, RunType::Manual);
    assert_eq!(engine.client.call_count("OrganizationRepositories"), 1);
    assert_eq!(Queries::recent_runs(engine.db.pool(), 10).await.unwrap().len(), 1);
    assert!(!engine.orchestrator.is_running());

    // Once finished, the next request starts a fresh run.
    let next = engine
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await
        .unwrap();
    assert_ne!(next.run_id, first.run_id);
}

#[tokio::test]
async fn test_schedule_enable_disable_restore() {
    let engine = setup_engine(client_with_widgets()).await;
    let pool = engine.db.pool();

    let err = engine.orchestrator.enable_automatic_sync(0).await.unwrap_err();
    assert!(matches!(err, SyncError::ValidationError(_)));
    let err = engine
        .orchestrator
        .enable_automatic_sync(MAX_SYNC_INTERVAL_MINUTES + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ValidationError(_)));
    let err = engine.orchestrator.enable_automatic_sync(i64::MAX).await.unwrap_err();
    assert!(matches!(err, SyncError::ValidationError(_)));
    assert!(!engine.orchestrator.is_scheduled());
    assert!(SyncState::get_settings(pool, ORG).await.unwrap().is_none());

    engine.orchestrator.enable_automatic_sync(15).await.unwrap();
    assert!(engine.orchestrator.is_scheduled());
    let settings = SyncState::get_settings(pool, ORG).await.unwrap().unwrap();
    assert!(settings.auto_sync_enabled);
    assert_eq!(settings.auto_sync_interval_minutes, Some(15));

    // A second orchestrator over the same store picks the schedule back up.
    let config = test_config();
    let collector = Collector::new(
        engine.db.clone(),
        engine.client.clone(),
        RateBudget::new(),
        config.collector_config(),
    );
    let restarted = Arc::new(SyncOrchestrator::new(
        engine.db.clone(),
        collector,
        config.orchestrator_config(),
    ));
    assert!(restarted.restore_schedule().await.unwrap());
    assert!(restarted.is_scheduled());

    engine.orchestrator.disable_automatic_sync().await.unwrap();
    assert!(!engine.orchestrator.is_scheduled());
    let settings = SyncState::get_settings(pool, ORG).await.unwrap().unwrap();
    assert!(!settings.auto_sync_enabled);
    assert_eq!(settings.auto_sync_interval_minutes, Some(15));

    restarted.disable_automatic_sync().await.unwrap();
    assert!(!restarted.restore_schedule().await.unwrap());
    assert!(!restarted.is_scheduled());
}
