//! Operator API: list/inspect endpoints and groups, drive manual
//! priority/pause/resume/activate transitions, and query the usage sink.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::{Group, GroupState};
use crate::server::AppState;
use crate::tracker::sink::{UsageQuery, UsageRow};
use crate::tracker::stats::{compute_window_stats, WindowStats};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/endpoints", get(list_endpoints))
        .route("/endpoints/{name}/priority", post(set_priority))
        .route("/endpoints/{name}/health-check", post(force_health_check))
        .route("/groups", get(list_groups))
        .route("/groups/{name}/activate", post(activate_group))
        .route("/groups/{name}/pause", post(pause_group))
        .route("/groups/{name}/resume", post(resume_group))
        .route("/usage/requests", get(list_usage_requests))
        .route("/usage/summary", get(usage_summary))
        .route("/usage/models", get(list_models))
        .route("/usage/endpoints", get(list_endpoint_names))
        .route("/usage/groups", get(list_group_names))
}

#[derive(Serialize)]
struct EndpointView {
    name: String,
    url: String,
    group: String,
    group_priority: u32,
    priority: u32,
    healthy: bool,
    never_checked: bool,
    consecutive_fails: u32,
    response_time_ms: Option<u128>,
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> Response {
    let views: Vec<EndpointView> = state
        .manager
        .list_endpoints()
        .into_iter()
        .map(|e| EndpointView {
            name: e.name,
            url: e.url,
            group: e.group,
            group_priority: e.group_priority,
            priority: e.priority,
            healthy: e.healthy,
            never_checked: e.never_checked,
            consecutive_fails: e.consecutive_fails,
            response_time_ms: e.response_time.map(|d| d.as_millis()),
        })
        .collect();
    Json(views).into_response()
}

#[derive(Deserialize)]
struct PriorityBody {
    priority: u32,
}

async fn set_priority(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Response {
    if state.manager.set_priority(&name, body.priority) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found("unknown endpoint")
    }
}

async fn force_health_check(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let config = state.runtime_config.snapshot().await;
    let found = crate::endpoint::probe_now(&state.manager, &config.health.health_path, &name).await;
    if found {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found("unknown endpoint")
    }
}

#[derive(Serialize)]
struct GroupView {
    name: String,
    priority: u32,
    state: &'static str,
    manually_paused: bool,
    force_activated: bool,
    healthy_count: usize,
    total_count: usize,
    can_activate: bool,
    can_pause: bool,
    can_resume: bool,
    can_force_activate: bool,
}

impl From<Group> for GroupView {
    fn from(g: Group) -> Self {
        Self {
            can_activate: g.can_activate(),
            can_pause: g.can_pause(),
            can_resume: g.can_resume(),
            can_force_activate: g.can_force_activate(),
            state: match g.state {
                GroupState::Active => "active",
                GroupState::Paused => "paused",
                GroupState::InCooldown => "cooldown",
            },
            name: g.name,
            priority: g.priority,
            manually_paused: g.manually_paused,
            force_activated: g.force_activated,
            healthy_count: g.healthy_count,
            total_count: g.total_count,
        }
    }
}

async fn list_groups(State(state): State<Arc<AppState>>) -> Response {
    let views: Vec<GroupView> = state.manager.list_groups().into_iter().map(GroupView::from).collect();
    Json(views).into_response()
}

#[derive(Deserialize)]
struct ActivateQuery {
    #[serde(default)]
    force: bool,
}

async fn activate_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<ActivateQuery>,
) -> Response {
    let result = if q.force {
        state.manager.force_activate_group(&name)
    } else {
        state.manager.activate_group(&name)
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(msg) => (StatusCode::CONFLICT, Json(serde_json::json!({ "error": msg }))).into_response(),
    }
}

async fn pause_group(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.manager.pause_group(&name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(msg) => (StatusCode::CONFLICT, Json(serde_json::json!({ "error": msg }))).into_response(),
    }
}

async fn resume_group(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.manager.resume_group(&name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(msg) => (StatusCode::CONFLICT, Json(serde_json::json!({ "error": msg }))).into_response(),
    }
}

#[derive(Deserialize)]
struct UsageRequestsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    status: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
    group: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}
fn default_limit() -> u32 {
    50
}

/// Accepts either a raw millisecond epoch or an RFC3339 timestamp
/// (`2026-07-28T00:00:00Z`), since operators querying `/api/v1/usage/requests`
/// by hand reach for calendar dates, not millis.
fn parse_timestamp_param(raw: &str) -> Result<i64, String> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| format!("'{raw}' is neither a millisecond epoch nor an RFC3339 timestamp"))
}

impl TryFrom<UsageRequestsQuery> for UsageQuery {
    type Error = String;

    fn try_from(q: UsageRequestsQuery) -> Result<Self, Self::Error> {
        Ok(Self {
            start_date_ms: q.start_date.as_deref().map(parse_timestamp_param).transpose()?,
            end_date_ms: q.end_date.as_deref().map(parse_timestamp_param).transpose()?,
            status: q.status,
            model: q.model,
            endpoint: q.endpoint,
            group: q.group,
            page: q.page,
            page_size: q.limit,
        })
    }
}

#[derive(Serialize)]
struct UsageRowView {
    #[serde(flatten)]
    row: UsageRow,
    start_time: String,
    end_time: Option<String>,
}

fn render_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

impl From<UsageRow> for UsageRowView {
    fn from(row: UsageRow) -> Self {
        Self {
            start_time: render_ms(row.start_time_ms),
            end_time: row.end_time_ms.map(render_ms),
            row,
        }
    }
}

async fn list_usage_requests(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UsageRequestsQuery>,
) -> Response {
    let query = match UsageQuery::try_from(q) {
        Ok(q) => q,
        Err(msg) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response(),
    };
    match state.tracker.query(&query) {
        Ok(rows) => Json(rows.into_iter().map(UsageRowView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(&err.to_string()),
    }
}

/// Aggregation cap: summary reads up to this many matching rows rather than
/// the caller's pagination `limit`, which governs `list_usage_requests`
/// instead.
const SUMMARY_ROW_CAP: u32 = 10_000;

async fn usage_summary(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UsageRequestsQuery>,
) -> Response {
    let query = match UsageQuery::try_from(q) {
        Ok(q) => UsageQuery {
            page: 1,
            page_size: SUMMARY_ROW_CAP,
            ..q
        },
        Err(msg) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response(),
    };
    match state.tracker.query(&query) {
        Ok(rows) => {
            let rows: Vec<UsageRow> = rows;
            let stats: WindowStats = compute_window_stats(&rows);
            Json(stats).into_response()
        }
        Err(err) => server_error(&err.to_string()),
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    distinct_response(&state, "model_name")
}

async fn list_endpoint_names(State(state): State<Arc<AppState>>) -> Response {
    distinct_response(&state, "endpoint_name")
}

async fn list_group_names(State(state): State<Arc<AppState>>) -> Response {
    distinct_response(&state, "group_name")
}

fn distinct_response(state: &Arc<AppState>, column: &str) -> Response {
    match state.tracker.distinct(column) {
        Ok(values) => Json(values).into_response(),
        Err(err) => server_error(&err.to_string()),
    }
}

fn not_found(msg: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": msg }))).into_response()
}

fn server_error(msg: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_epoch() {
        assert_eq!(parse_timestamp_param("1700000000000"), Ok(1700000000000));
    }

    #[test]
    fn parses_rfc3339_timestamp() {
        let ms = parse_timestamp_param("2023-11-14T22:13:20Z").unwrap();
        assert_eq!(ms, 1700000000000);
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_timestamp_param("not-a-date").is_err());
    }

    #[test]
    fn render_ms_round_trips_through_rfc3339() {
        let rendered = render_ms(1700000000000);
        assert_eq!(parse_timestamp_param(&rendered), Ok(1700000000000));
    }
}
