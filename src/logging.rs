//! Startup tracing setup and structured per-request logging, mirroring the
//! teacher's `logging` module: a JSON-line shape per finished request plus a
//! retry-chain trace for diagnostics.

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Defaults to `info` unless
/// `RUST_LOG` is set. `json` switches the formatter to newline-delimited
/// JSON, the shape operators typically want once this runs under a
/// container log collector rather than an interactive terminal.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

/// One JSON line per finished request: service-level summary of what
/// happened, independent of the durable sink record.
#[derive(Debug, Serialize)]
pub struct RequestLogLine<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status: &'a str,
    pub http_status_code: Option<u16>,
    pub duration_ms: Option<i64>,
    pub endpoint: Option<&'a str>,
    pub group: Option<&'a str>,
    pub retry_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub fn log_request(line: &RequestLogLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => tracing::info!(target: "relay_gateway::request", "{json}"),
        Err(err) => tracing::warn!(error = %err, "failed to serialize request log line"),
    }
}

/// Diagnostic trace of a single forwarding attempt, emitted once per
/// candidate/retry in the dispatcher's forwarding loop (mirrors the
/// teacher's `log_retry_trace`: a free-form JSON blob rather than a fixed
/// schema, since the set of useful fields varies by failure mode).
pub fn log_retry_trace(value: serde_json::Value) {
    tracing::debug!(target: "relay_gateway::retry_trace", "{value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_log_line_serializes_to_valid_json() {
        let line = RequestLogLine {
            request_id: "req-1",
            method: "POST",
            path: "/v1/messages",
            status: "completed",
            http_status_code: Some(200),
            duration_ms: Some(120),
            endpoint: Some("ep-a"),
            group: Some("main"),
            retry_count: 1,
            input_tokens: 10,
            output_tokens: 20,
        };
        let json = serde_json::to_string(&line).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["retry_count"], 1);
    }
}
