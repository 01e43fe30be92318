//! Request Dispatcher: walks candidate endpoints with retry, suspends on an
//! empty pool, and hands a committed 2xx response off to the Response
//! Pipeline.

pub mod classify;
pub mod retry;
mod suspend;

pub use suspend::{SuspendOutcome, SuspendTable};

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use metrics::counter;
use tracing::{info, instrument, warn};

use crate::config::GatewayConfig;
use crate::endpoint::{Endpoint, EndpointManager};
use crate::error::DispatchError;

/// Hop-by-hop headers that must never be forwarded verbatim.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Parses the `Connection` header's token list, which names additional
/// per-hop headers to strip beyond the fixed set above.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.contains(&name) || connection_tokens.iter().any(|t| t == name)
}

/// Strips hop-by-hop headers from an inbound request before forwarding it
/// upstream.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers);
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str(), &tokens) || name == axum::http::header::HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Strips headers the pipeline recomputes itself: `Content-Length`,
/// `Transfer-Encoding`, `Connection`, `Content-Encoding`.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers);
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let n = name.as_str();
        if is_hop_by_hop(n, &tokens)
            || n == "content-length"
            || n == "content-encoding"
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: String,
    pub method: axum::http::Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: Option<String>,
    pub client_auth_header: Option<HeaderValue>,
}

/// A response committed to the client: either the dispatcher found a 2xx
/// upstream response, or every candidate/attempt was exhausted and produced
/// a definite failure.
pub struct CommittedResponse {
    pub upstream: reqwest::Response,
    pub endpoint_name: String,
    pub group_name: String,
    pub retry_count: u32,
}

pub struct Dispatcher {
    manager: Arc<EndpointManager>,
    suspend_table: Arc<SuspendTable>,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(manager: Arc<EndpointManager>, config: &GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            suspend_table: SuspendTable::new(config.request_suspend.max_suspended_requests),
            http: reqwest::Client::builder()
                .build()
                .expect("building upstream http client"),
        })
    }

    pub fn suspend_table(&self) -> &Arc<SuspendTable> {
        &self.suspend_table
    }

    #[instrument(skip(self, config, req), fields(request_id = %req.request_id))]
    pub async fn dispatch(
        &self,
        config: &GatewayConfig,
        req: &DispatchRequest,
    ) -> Result<CommittedResponse, DispatchError> {
        let single_shot = req.body.len() > config.body_cap_bytes;
        if single_shot {
            warn!(
                request_id = %req.request_id,
                cap = config.body_cap_bytes,
                len = req.body.len(),
                "request body exceeds cap; disabling retry for this request"
            );
        }

        let mut total_attempts: u32 = 0;

        loop {
            let mut candidates = self.manager.select_candidates();
            if let Some(model) = req.model.as_deref() {
                candidates.retain(|e| e.supports_model(model));
            }

            if candidates.is_empty() {
                if !config.request_suspend.enabled {
                    return Err(DispatchError::NoActiveGroup);
                }
                if self.suspend_table.at_capacity() {
                    return Err(DispatchError::SuspendCapExceeded);
                }
                let outcome = suspend::suspend_until_active(
                    &self.suspend_table,
                    &self.manager,
                    &req.request_id,
                    config.request_suspend.timeout,
                )
                .await;
                match outcome {
                    SuspendOutcome::Resumed => continue,
                    SuspendOutcome::TimedOut => return Err(DispatchError::SuspendTimeout),
                    SuspendOutcome::Cancelled => return Err(DispatchError::ClientCancelled),
                }
            }

            let max_attempts = if single_shot { 1 } else { config.retry.max_attempts };
            let candidates = if single_shot {
                candidates.into_iter().take(1).collect::<Vec<_>>()
            } else {
                candidates
            };

            let attempt_budget = candidates.len() as u32 * max_attempts;
            let mut last_headers: Option<HeaderMap> = None;

            for endpoint in &candidates {
                for attempt_index in 0..max_attempts {
                    if attempt_index > 0 {
                        retry::sleep_before_retry(&config.retry, attempt_index - 1, last_headers.as_ref())
                            .await;
                    }
                    total_attempts += 1;
                    counter!("relay_gateway_upstream_attempts_total", "endpoint" => endpoint.name.clone())
                        .increment(1);

                    match self.try_attempt(req, endpoint).await {
                        Ok(resp) => {
                            let status = resp.status();
                            if status.is_success() {
                                info!(
                                    request_id = %req.request_id,
                                    endpoint = %endpoint.name,
                                    attempts = total_attempts,
                                    "committing upstream response"
                                );
                                return Ok(CommittedResponse {
                                    upstream: resp,
                                    endpoint_name: endpoint.name.clone(),
                                    group_name: endpoint.group.clone(),
                                    retry_count: total_attempts,
                                });
                            }

                            let code = status.as_u16();
                            if code == 408 || code == 429 || (500..600).contains(&code) {
                                crate::logging::log_retry_trace(serde_json::json!({
                                    "request_id": req.request_id,
                                    "endpoint": endpoint.name,
                                    "attempt": total_attempts,
                                    "outcome": "retryable_status",
                                    "status": code,
                                }));
                                last_headers = Some(resp.headers().clone());
                                continue; // retryable, try again
                            }

                            // 4xx other than 408/429: surfaced to the client as-is.
                            return Ok(CommittedResponse {
                                upstream: resp,
                                endpoint_name: endpoint.name.clone(),
                                group_name: endpoint.group.clone(),
                                retry_count: total_attempts,
                            });
                        }
                        Err(err) if err.retryable() => {
                            crate::logging::log_retry_trace(serde_json::json!({
                                "request_id": req.request_id,
                                "endpoint": endpoint.name,
                                "attempt": total_attempts,
                                "outcome": "retryable_error",
                                "reason": err.reason_tag(),
                            }));
                            last_headers = None;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            debug_assert!(total_attempts >= attempt_budget || candidates.is_empty());

            if single_shot {
                return Err(DispatchError::Upstream5xx { status: 502, retry_count: total_attempts });
            }
            // Exhaustion: loop back to step 1 to possibly suspend again,
            // unless suspension is disabled or at capacity.
            if !config.request_suspend.enabled || self.suspend_table.at_capacity() {
                return Err(DispatchError::Upstream5xx { status: 502, retry_count: total_attempts });
            }
        }
    }

    async fn try_attempt(
        &self,
        req: &DispatchRequest,
        endpoint: &Endpoint,
    ) -> Result<reqwest::Response, DispatchError> {
        let url = format!("{}{}", endpoint.url, req.path_and_query);
        let mut headers = filter_request_headers(&req.headers);

        if let Some(token) = endpoint.resolve_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| DispatchError::ConnectError("invalid token header value".into()))?;
            headers.insert(axum::http::header::AUTHORIZATION, value);
        } else if let Some(auth) = req.client_auth_header.clone() {
            headers.insert(axum::http::header::AUTHORIZATION, auth);
        }

        let reqwest_headers = to_reqwest_headers(&headers);

        let result = self
            .http
            .request(
                reqwest::Method::from_bytes(req.method.as_str().as_bytes())
                    .unwrap_or(reqwest::Method::POST),
                &url,
            )
            .headers(reqwest_headers)
            .body(req.body.clone())
            .timeout(endpoint.timeout)
            .send()
            .await;

        match result {
            Ok(resp) => Ok(resp),
            Err(err) if err.is_timeout() => Err(DispatchError::Timeout),
            Err(err) => Err(DispatchError::ConnectError(err.to_string())),
        }
    }
}

fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let Ok(n) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            && let Ok(v) = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
        {
            out.append(n, v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fixed_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-custom", "value".parse().unwrap());
        let filtered = filter_request_headers(&headers);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("keep-alive").is_none());
        assert!(filtered.get("x-custom").is_some());
    }

    #[test]
    fn strips_headers_named_in_connection_token_list() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "x-session-token".parse().unwrap());
        headers.insert("x-session-token", "abc".parse().unwrap());
        let filtered = filter_request_headers(&headers);
        assert!(filtered.get("x-session-token").is_none());
    }

    #[test]
    fn response_header_filter_drops_content_length_and_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "123".parse().unwrap());
        headers.insert("content-encoding", "gzip".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        let filtered = filter_response_headers(&headers);
        assert!(filtered.get("content-length").is_none());
        assert!(filtered.get("content-encoding").is_none());
        assert!(filtered.get("x-request-id").is_some());
    }
}

/// Integration-style tests exercising `dispatch()` end to end against real
/// local HTTP servers, pinning down the retry-count invariants instead of
/// trusting the forwarding loop's bookkeeping in isolation.
#[cfg(test)]
mod dispatch_tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use axum::response::IntoResponse;

    use super::*;
    use crate::config::{EndpointConfig, GatewayConfig, GroupConfig, RetryConfig};
    use crate::endpoint::EndpointManager;

    /// Serves a fixed sequence of canned responses off a local socket, one
    /// per request, in order. Requests past the end of the sequence get 500.
    async fn spawn_canned_endpoint(responses: Vec<(u16, &'static str)>) -> String {
        let queue = Arc::new(StdMutex::new(VecDeque::from(responses)));
        let app = axum::Router::new().fallback(move || {
            let queue = Arc::clone(&queue);
            async move {
                match queue.lock().unwrap().pop_front() {
                    Some((status, body)) => {
                        (axum::http::StatusCode::from_u16(status).unwrap(), body).into_response()
                    }
                    None => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                }
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn endpoint_config(name: &str, url: String, priority: u32) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url,
            group: "main".to_string(),
            group_priority: 0,
            priority,
            token: None,
            token_env: None,
            timeout: None,
            supported_models: Default::default(),
            model_mapping: Default::default(),
        }
    }

    fn test_config(endpoints: Vec<EndpointConfig>, max_attempts: u32) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.group = GroupConfig {
            auto_switch_between_groups: true,
            cooldown: Duration::from_millis(50),
        };
        cfg.retry = RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
        };
        cfg.endpoints = endpoints;
        cfg
    }

    fn test_request(id: &str) -> DispatchRequest {
        DispatchRequest {
            request_id: id.to_string(),
            method: axum::http::Method::POST,
            path_and_query: "/v1/messages".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            model: None,
            client_auth_header: None,
        }
    }

    #[tokio::test]
    async fn retry_then_success_commits_to_the_recovering_endpoint() {
        let url_a = spawn_canned_endpoint(vec![(500, "err"), (500, "err"), (500, "err")]).await;
        let url_b = spawn_canned_endpoint(vec![(
            200,
            r#"{"model":"m","usage":{"input_tokens":1,"output_tokens":2}}"#,
        )])
        .await;
        let cfg = test_config(
            vec![endpoint_config("a", url_a, 0), endpoint_config("b", url_b, 1)],
            3,
        );
        let manager = EndpointManager::new(&cfg);
        manager.record_probe_result("a", true, Duration::from_millis(1));
        manager.record_probe_result("b", true, Duration::from_millis(1));
        let dispatcher = Dispatcher::new(Arc::clone(&manager), &cfg);

        let committed = dispatcher
            .dispatch(&cfg, &test_request("req-1"))
            .await
            .expect("endpoint b should eventually serve the request");
        assert_eq!(committed.endpoint_name, "b");
        // 3 failed attempts on `a` plus the successful attempt on `b`: every
        // attempt consumed across every endpoint counts toward retry_count.
        assert_eq!(committed.retry_count, 4);
    }

    #[tokio::test]
    async fn full_exhaustion_records_candidates_times_max_attempts() {
        let url_a = spawn_canned_endpoint(vec![(500, "err"), (500, "err")]).await;
        let url_b = spawn_canned_endpoint(vec![(500, "err"), (500, "err")]).await;
        let mut cfg = test_config(
            vec![endpoint_config("a", url_a, 0), endpoint_config("b", url_b, 1)],
            2,
        );
        cfg.request_suspend.enabled = false;
        let manager = EndpointManager::new(&cfg);
        manager.record_probe_result("a", true, Duration::from_millis(1));
        manager.record_probe_result("b", true, Duration::from_millis(1));
        let dispatcher = Dispatcher::new(Arc::clone(&manager), &cfg);

        let err = dispatcher
            .dispatch(&cfg, &test_request("req-2"))
            .await
            .expect_err("both endpoints exhaust every attempt");
        assert_eq!(err.retry_count(), Some(4));
    }
}
