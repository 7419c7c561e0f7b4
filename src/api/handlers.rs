use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::database::models::{RunType, SyncLog, SyncRun};
use crate::database::queries::Queries;
use crate::realign::{RealignOptions, RealignSummary};
use crate::sync::SyncSummary;

#[derive(Debug, Deserialize)]
pub struct BackfillRequest {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub interval_minutes: i64,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunWithLogs {
    #[serde(flatten)]
    pub run: SyncRun,
    pub logs: Vec<SyncLog>,
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "activity-sync",
        "timestamp": Utc::now()
    }))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let orchestrator = &state.orchestrator;
    let pool = orchestrator.database().pool();

    let settings = orchestrator.settings().await?;
    let cursors = Queries::cursors(pool).await?;
    let runs = Queries::recent_runs(pool, 5).await?;
    let counts = Queries::counts(pool).await?;

    Ok(Json(json!({
        "organization": orchestrator.organization(),
        "running": orchestrator.is_running(),
        "scheduled": orchestrator.is_scheduled(),
        "settings": settings,
        "cursors": cursors,
        "recent_runs": runs,
        "counts": counts,
        "timestamp": Utc::now()
    })))
}

pub async fn runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunWithLogs>>, ApiError> {
    let pool = state.orchestrator.database().pool();
    let limit = query.limit.unwrap_or(20).clamp(1, 200);

    let mut runs = Vec::new();
    for run in Queries::recent_runs(pool, limit).await? {
        let logs = Queries::logs_for_run(pool, &run.id).await?;
        runs.push(RunWithLogs { run, logs });
    }
    Ok(Json(runs))
}

pub async fn sync_incremental(State(state): State<AppState>) -> Result<Json<SyncSummary>, ApiError> {
    let summary = state
        .orchestrator
        .run_incremental_sync(RunType::Manual)
        .await?;
    Ok(Json(summary))
}

pub async fn sync_backfill(
    State(state): State<AppState>,
    Json(request): Json<BackfillRequest>,
) -> Result<Json<SyncSummary>, ApiError> {
    let summary = state
        .orchestrator
        .run_backfill(request.start, request.end)
        .await?;
    Ok(Json(summary))
}

pub async fn enable_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .enable_automatic_sync(request.interval_minutes)
        .await?;
    Ok(Json(json!({ "enabled": true, "interval_minutes": request.interval_minutes })))
}

pub async fn disable_schedule(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.orchestrator.disable_automatic_sync().await?;
    Ok(Json(json!({ "enabled": false })))
}

pub async fn realign(
    State(state): State<AppState>,
    options: Option<Json<RealignOptions>>,
) -> Result<Json<RealignSummary>, ApiError> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let summary = state.realigner.realign(&options).await?;
    Ok(Json(summary))
}
