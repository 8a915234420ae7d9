//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::classify::Classification;
use crate::ingest::RunRecord;
use crate::query::{Scope, TrendMetric};
use crate::storage::{DayRange, HistoryWindow};

const DEFAULT_RANGE_DAYS: u32 = 7;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(ingest_run))
        .route("/summary", get(summary))
        .route("/tests", get(list_tests))
        .route("/tests/{id}", get(get_test))
        .route("/tests/{id}/history", get(test_history))
        .route("/flake-rate", get(flake_rate))
        .route("/slowest", get(slowest))
        .route("/trend", get(trend))
        .route("/gate/{run_id}", get(gate))
        .route("/transitions", get(transitions))
        .route("/quarantine", get(list_quarantine))
        .route("/quarantine/{id}", post(add_quarantine).delete(remove_quarantine))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// Run a synchronous database read off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
        .map_err(ApiError::Internal)
}

/// Whole UTC days: `from..=to`, or the `days` days ending `to` (today by default).
fn day_range(
    days: Option<u32>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<DayRange, ApiError> {
    let last = to.unwrap_or_else(|| Utc::now().date_naive());
    match from {
        Some(first) => Ok(DayRange::new(first, last)),
        None => DayRange::ending(last, days.unwrap_or(DEFAULT_RANGE_DAYS))
            .ok_or_else(|| ApiError::BadRequest("'days' reaches outside the calendar".into())),
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn ingest_run(
    State(state): State<AppState>,
    Json(record): Json<RunRecord>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let report = state.app.ingest(record).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": report, "meta": meta() })),
    ))
}

async fn summary(State(state): State<AppState>) -> Json<Value> {
    let summary = state.app.query().summary();
    Json(json!({ "data": summary, "meta": meta() }))
}

#[derive(Debug, Deserialize)]
struct TestsParams {
    classification: Option<String>,
}

async fn list_tests(
    State(state): State<AppState>,
    Query(params): Query<TestsParams>,
) -> Result<Json<Value>, ApiError> {
    let only = match params.classification.as_deref() {
        Some(raw) => Some(raw.parse::<Classification>().map_err(ApiError::BadRequest)?),
        None => None,
    };
    let tests = state.app.query().snapshot(only);
    Ok(Json(json!({
        "data": tests,
        "meta": { "total": tests.len(), "version": env!("CARGO_PKG_VERSION") }
    })))
}

async fn get_test(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let test = state
        .app
        .query()
        .classification(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no classification for test '{id}'")))?;
    Ok(Json(json!({ "data": test, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    since: Option<chrono::DateTime<Utc>>,
    until: Option<chrono::DateTime<Utc>>,
}

async fn test_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let window = match (params.since, params.until) {
        (Some(start), Some(end)) => HistoryWindow::Between(start, end),
        (Some(start), None) => HistoryWindow::Since(start),
        (None, Some(_)) => return Err(ApiError::BadRequest("'until' requires 'since'".into())),
        (None, None) => HistoryWindow::Latest(
            params
                .limit
                .unwrap_or(state.app.config().classifier.window_size),
        ),
    };
    let query = state.app.query().clone();
    let entries = blocking(move || query.history(&id, window)).await?;
    Ok(Json(json!({
        "data": entries,
        "meta": { "total": entries.len(), "version": env!("CARGO_PKG_VERSION") }
    })))
}

#[derive(Debug, Deserialize)]
struct FlakeRateParams {
    test: Option<String>,
    days: Option<u32>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn flake_rate(
    State(state): State<AppState>,
    Query(params): Query<FlakeRateParams>,
) -> Result<Json<Value>, ApiError> {
    let scope = params.test.map_or(Scope::All, Scope::Test);
    let range = day_range(params.days, params.from, params.to)?;
    let query = state.app.query().clone();
    let report = blocking(move || query.flake_rate(&scope, range)).await?;
    Ok(Json(json!({ "data": report, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct SlowestParams {
    n: Option<usize>,
    days: Option<u32>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn slowest(
    State(state): State<AppState>,
    Query(params): Query<SlowestParams>,
) -> Result<Json<Value>, ApiError> {
    let n = params.n.unwrap_or(10);
    let range = day_range(params.days, params.from, params.to)?;
    let query = state.app.query().clone();
    let rows = blocking(move || query.slowest_tests(n, range)).await?;
    Ok(Json(json!({
        "data": rows,
        "meta": { "total": rows.len(), "range": range, "version": env!("CARGO_PKG_VERSION") }
    })))
}

#[derive(Debug, Deserialize)]
struct TrendParams {
    metric: String,
    branch: Option<String>,
    baseline_from: Option<NaiveDate>,
    baseline_to: Option<NaiveDate>,
    days: Option<u32>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn trend(
    State(state): State<AppState>,
    Query(params): Query<TrendParams>,
) -> Result<Json<Value>, ApiError> {
    let metric: TrendMetric = params.metric.parse().map_err(ApiError::BadRequest)?;
    let current = day_range(params.days, params.from, params.to)?;
    let baseline = match (params.baseline_from, params.baseline_to) {
        (Some(first), Some(last)) => DayRange::new(first, last),
        (None, None) => current.preceding().ok_or_else(|| {
            ApiError::BadRequest("baseline range reaches outside the calendar".into())
        })?,
        _ => {
            return Err(ApiError::BadRequest(
                "baseline_from and baseline_to go together".into(),
            ))
        }
    };
    let query = state.app.query().clone();
    let branch = params.branch;
    let delta = blocking(move || query.trend_delta(metric, branch.as_deref(), current, Some(baseline))).await?;
    Ok(Json(json!({ "data": delta, "meta": meta() })))
}

async fn gate(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let query = state.app.query().clone();
    let lookup = run_id.clone();
    let decision = blocking(move || query.gate(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown run '{run_id}'")))?;
    Ok(Json(json!({ "data": decision, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct TransitionParams {
    test: Option<String>,
    limit: Option<usize>,
}

async fn transitions(
    State(state): State<AppState>,
    Query(params): Query<TransitionParams>,
) -> Result<Json<Value>, ApiError> {
    let query = state.app.query().clone();
    let limit = params.limit.unwrap_or(50);
    let events = blocking(move || query.transitions(params.test.as_deref(), limit)).await?;
    Ok(Json(json!({
        "data": events,
        "meta": { "total": events.len(), "version": env!("CARGO_PKG_VERSION") }
    })))
}

async fn list_quarantine(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let entries = state.app.quarantined().await?;
    Ok(Json(json!({
        "data": entries,
        "meta": { "total": entries.len(), "version": env!("CARGO_PKG_VERSION") }
    })))
}

#[derive(Debug, Deserialize)]
struct QuarantineBody {
    #[serde(default)]
    reason: String,
}

async fn add_quarantine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<QuarantineBody>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    if !state.app.quarantine(&id, &reason).await? {
        return Err(ApiError::NotFound(format!("unknown test '{id}'")));
    }
    Ok(Json(json!({ "data": { "identity_id": id, "quarantined": true }, "meta": meta() })))
}

async fn remove_quarantine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.app.unquarantine(&id).await? {
        return Err(ApiError::NotFound(format!("test '{id}' is not quarantined")));
    }
    Ok(Json(json!({ "data": { "identity_id": id, "quarantined": false }, "meta": meta() })))
}
