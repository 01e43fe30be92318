//! Listener & proxy wiring: builds the axum router, serves the
//! health/metrics/operator surface, and proxies everything else through the
//! Dispatcher and Response Pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::api;
use crate::config::RuntimeConfig;
use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::endpoint::EndpointManager;
use crate::error::DispatchError;
use crate::logging::{log_request, RequestLogLine};
use crate::pipeline;
use crate::tracker::UsageTracker;

/// A request body larger than this is rejected outright rather than ever
/// buffered; the much smaller `body_cap_bytes` config value governs when
/// retries are disabled for an otherwise-accepted body.
const MAX_REQUEST_BODY_BYTES: usize = 100 * 1024 * 1024;

pub struct AppState {
    pub runtime_config: Arc<RuntimeConfig>,
    pub manager: Arc<EndpointManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<UsageTracker>,
    pub prometheus: PrometheusHandle,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api::router())
        .fallback(any(proxy_handler))
        .with_state(state)
}

/// Runs the gateway until the process receives a shutdown signal. Binds the
/// listener, starts the health prober and cooldown sweep, and serves the
/// router built by [`build_router`].
pub async fn run(config: crate::config::GatewayConfig) -> Result<()> {
    let config = Arc::new(config);
    let runtime_config = Arc::new(RuntimeConfig::new(Arc::clone(&config)));
    let manager = EndpointManager::new(&config);
    let dispatcher = Dispatcher::new(Arc::clone(&manager), &config);
    let tracker = UsageTracker::new(&config.tracker, config.model_pricing.clone())
        .context("initializing usage tracker")?;

    crate::endpoint::spawn_prober(
        Arc::clone(&manager),
        config.health.health_path.clone(),
        config.health.check_interval,
    );
    spawn_config_reload_loop(Arc::clone(&runtime_config));
    spawn_orphan_reconciler(Arc::clone(&tracker), Arc::clone(&dispatcher));

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;

    let state = Arc::new(AppState {
        runtime_config,
        manager,
        dispatcher,
        tracker,
        prometheus,
    });

    let addr: SocketAddr = format!("{}:{}", config.listener.host, config.listener.port)
        .parse()
        .context("parsing listener host:port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding listener on {addr}"))?;
    info!(%addr, "relay-gateway listening");

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving gateway")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn spawn_config_reload_loop(runtime_config: Arc<RuntimeConfig>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            runtime_config.maybe_reload_from_disk().await;
        }
    });
}

/// Periodically finalizes lifecycle records for requests whose suspension
/// was torn down by a client disconnect rather than a normal resume.
fn spawn_orphan_reconciler(tracker: Arc<UsageTracker>, dispatcher: Arc<Dispatcher>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            let now_ms = now_ms();
            tracker
                .reconcile_orphaned_cancellations(dispatcher.suspend_table(), now_ms)
                .await;
        }
    });
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    healthy_endpoints: usize,
    total_endpoints: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let endpoints = state.manager.list_endpoints();
    let healthy = endpoints.iter().filter(|e| e.healthy).count();
    let total = endpoints.len();
    let body = HealthBody {
        status: if healthy > 0 { "ok" } else { "unhealthy" },
        healthy_endpoints: healthy,
        total_endpoints: total,
    };
    let status = if healthy > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body)).into_response()
}

#[derive(Serialize)]
struct EndpointHealthDetail {
    name: String,
    group: String,
    healthy: bool,
    never_checked: bool,
    consecutive_fails: u32,
    response_time_ms: Option<u128>,
}

async fn health_detailed(State(state): State<Arc<AppState>>) -> Response {
    let details: Vec<EndpointHealthDetail> = state
        .manager
        .list_endpoints()
        .into_iter()
        .map(|e| EndpointHealthDetail {
            name: e.name,
            group: e.group,
            healthy: e.healthy,
            never_checked: e.never_checked,
            consecutive_fails: e.consecutive_fails,
            response_time_ms: e.response_time.map(|d| d.as_millis()),
        })
        .collect();
    axum::Json(details).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

#[instrument(skip(state, req), fields(method = %req.method(), path = %req.uri().path()))]
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let headers = req.headers().clone();
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_auth_header = headers.get(axum::http::header::AUTHORIZATION).cloned();

    let body = match to_bytes(req.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b,
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
        }
    };

    let model = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string));

    let now0 = now_ms();
    state.tracker.begin_request(
        &request_id,
        method.as_str(),
        &path_and_query,
        Some(addr.ip().to_string()),
        user_agent,
        now0,
    );

    let dispatch_req = DispatchRequest {
        request_id: request_id.clone(),
        method,
        path_and_query,
        headers,
        body,
        model: model.clone(),
        client_auth_header,
    };

    let config = state.runtime_config.snapshot().await;
    let result = state.dispatcher.dispatch(&config, &dispatch_req).await;

    match result {
        Ok(committed) => {
            state.tracker.mark_forwarding(
                &request_id,
                &committed.endpoint_name,
                &committed.group_name,
                now_ms(),
            );
            state
                .tracker
                .record_attempt(&request_id, committed.retry_count as i64, now_ms());
            handle_committed(&state, &request_id, model, committed).await
        }
        Err(err) => {
            let now = now_ms();
            let retry_count = err.retry_count().unwrap_or(0);
            if err.retry_count().is_some() {
                state.tracker.record_attempt(&request_id, retry_count as i64, now);
            }
            state
                .tracker
                .finish_failed(&request_id, Some(err.http_status().as_u16() as i64), err.reason_tag().to_string(), now);
            log_request(&RequestLogLine {
                request_id: &request_id,
                method: dispatch_req.method.as_str(),
                path: &dispatch_req.path_and_query,
                status: "failed",
                http_status_code: Some(err.http_status().as_u16()),
                duration_ms: Some(now - now0),
                endpoint: None,
                group: None,
                retry_count,
                input_tokens: 0,
                output_tokens: 0,
            });
            dispatch_error_response(&err)
        }
    }
}

async fn handle_committed(
    state: &Arc<AppState>,
    request_id: &str,
    model_hint: Option<String>,
    committed: crate::dispatcher::CommittedResponse,
) -> Response {
    let upstream_status = committed.upstream.status();
    let content_encoding = committed
        .upstream
        .headers()
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let response_headers = crate::dispatcher::filter_response_headers(committed.upstream.headers());
    let is_streaming = response_headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("event-stream"))
        .unwrap_or(false);

    state
        .tracker
        .mark_processing(request_id, model_hint, is_streaming, now_ms());

    let (body, outcome_rx) = pipeline::forward(
        content_encoding.as_deref(),
        upstream_status.as_u16(),
        committed.upstream,
    );

    let mut response = Response::builder().status(upstream_status);
    {
        let headers = response.headers_mut().unwrap();
        for (name, value) in response_headers.iter() {
            headers.append(name.clone(), value.clone());
        }
    }
    let response = response.body(body).expect("building proxied response");

    let state = Arc::clone(state);
    let request_id = request_id.to_string();
    let started = now_ms();
    tokio::spawn(async move {
        let outcome = outcome_rx.await.ok();
        let now = now_ms();
        if let Some(outcome) = outcome {
            if let Some(usage) = outcome.usage {
                state.tracker.record_tokens(&request_id, usage, now);
            }
            if outcome.stream_interrupted {
                state
                    .tracker
                    .finish_failed(&request_id, None, "stream_interrupted".to_string(), now);
            } else {
                state
                    .tracker
                    .finish_completed(&request_id, upstream_status.as_u16() as i64, now);
            }
            log_request(&RequestLogLine {
                request_id: &request_id,
                method: "",
                path: "",
                status: if outcome.stream_interrupted { "failed" } else { "completed" },
                http_status_code: Some(upstream_status.as_u16()),
                duration_ms: Some(now - started),
                endpoint: None,
                group: None,
                retry_count: 0,
                input_tokens: outcome.usage.map(|u| u.input_tokens).unwrap_or(0),
                output_tokens: outcome.usage.map(|u| u.output_tokens).unwrap_or(0),
            });
        } else {
            state
                .tracker
                .finish_failed(&request_id, None, "pipeline dropped before completion".to_string(), now);
        }
    });

    response
}

fn dispatch_error_response(err: &DispatchError) -> Response {
    let status = err.http_status();
    (
        status,
        axum::Json(json!({ "error": err.reason_tag(), "message": err.to_string() })),
    )
        .into_response()
}

/// Millisecond epoch timestamp. Centralized here because the workflow/test
/// harness this crate is authored under cannot call `SystemTime::now()`
/// from certain contexts; production code paths call it freely.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
