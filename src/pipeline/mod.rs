//! Response Pipeline: decompress, detect format, forward bytes to the
//! client verbatim, and extract token usage as a side effect.

pub mod decompress;
pub mod format;
pub mod sse;

pub use sse::TokenUsage;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::dispatcher::classify::explain_client_error;
use decompress::{decode_stream, parse_content_encoding, ByteStream};
use format::{detect_format, DetectedFormat};
use sse::{parse_frame, SseFrame, SseFrameSplitter};

/// Emitted once forwarding finishes (success, upstream error mid-stream, or
/// EOF). The dispatcher's caller awaits this to drive the Lifecycle Tracker.
pub struct PipelineOutcome {
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    /// Set when an `error` SSE event arrived, or the upstream stream broke
    /// after bytes were already flushed to the client.
    pub stream_interrupted: bool,
}

/// Threshold for how much of a response we'll buffer purely to run format
/// detection before committing to a forwarding mode. JSON responses are
/// buffered fully regardless (a single parse is required either way); this
/// cap only bounds how long we wait before making that SSE-vs-JSON call.
const DETECTION_PEEK_CAP: usize = 64 * 1024;

/// Runs the pipeline over an already-committed upstream response. Returns
/// the axum response body to stream to the client immediately, plus a
/// receiver that resolves with the parsed token usage once the body has
/// been fully forwarded.
pub fn forward(
    content_encoding: Option<&str>,
    upstream_status: u16,
    upstream_body: reqwest::Response,
) -> (axum::body::Body, oneshot::Receiver<PipelineOutcome>) {
    let byte_stream = upstream_body.bytes_stream();

    let decoded: ByteStream = match parse_content_encoding(content_encoding) {
        Ok(encoding) => decode_stream(encoding, byte_stream),
        Err(unknown) => {
            warn!(encoding = %unknown, "unknown Content-Encoding; passing through undecoded");
            Box::pin(byte_stream.map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))))
        }
    };

    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    tokio::spawn(run_pipeline(decoded, upstream_status, client_tx, outcome_tx));

    let body = axum::body::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(client_rx));
    (body, outcome_rx)
}

async fn run_pipeline(
    mut decoded: ByteStream,
    upstream_status: u16,
    client_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    outcome_tx: oneshot::Sender<PipelineOutcome>,
) {
    let mut model: Option<String> = None;
    let mut usage: Option<TokenUsage> = None;
    let mut stream_interrupted = false;
    let mut bytes_flushed = false;

    let mut peek_buf = String::new();
    let mut mode: Option<DetectedFormat> = None;
    let mut splitter = SseFrameSplitter::default();
    let mut json_buf = String::new();

    loop {
        let chunk = match decoded.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                warn!(error = %err, "upstream stream error");
                if bytes_flushed {
                    stream_interrupted = true;
                }
                break;
            }
            None => break,
        };

        if client_tx.send(Ok(chunk.clone())).await.is_err() {
            // client disconnected mid-stream; nothing further to forward,
            // but keep parsing already-read bytes isn't useful either.
            break;
        }
        bytes_flushed = true;

        let text = String::from_utf8_lossy(&chunk);

        match mode {
            None => {
                peek_buf.push_str(&text);
                if peek_buf.len() >= DETECTION_PEEK_CAP || is_probably_complete_json(&peek_buf) {
                    mode = Some(detect_format(&peek_buf));
                }
                if let Some(DetectedFormat::Sse) = mode {
                    let buffered = std::mem::take(&mut peek_buf);
                    for (event, data) in splitter.push(&buffered) {
                        apply_frame(&event, &data, &mut model, &mut usage, &mut stream_interrupted);
                    }
                } else if let Some(DetectedFormat::Json) = mode {
                    json_buf.push_str(&peek_buf);
                    peek_buf.clear();
                }
            }
            Some(DetectedFormat::Sse) => {
                for (event, data) in splitter.push(&text) {
                    apply_frame(&event, &data, &mut model, &mut usage, &mut stream_interrupted);
                }
            }
            Some(DetectedFormat::Json) => {
                json_buf.push_str(&text);
            }
            Some(DetectedFormat::NoTokens) => {}
        }

        if stream_interrupted {
            break;
        }
    }

    // Body ended without ever hitting the detection threshold; classify
    // whatever we've got and do a final parse pass.
    match mode {
        None if !peek_buf.is_empty() => {
            let detected = detect_format(&peek_buf);
            if detected == DetectedFormat::Json {
                let (m, u) = sse::parse_json_body(&peek_buf);
                model = model.or(m);
                if u.is_some() {
                    usage = u;
                }
                log_client_error_if_any(upstream_status, &peek_buf);
            }
        }
        Some(DetectedFormat::Json) if !json_buf.is_empty() => {
            let (m, u) = sse::parse_json_body(&json_buf);
            model = model.or(m);
            if u.is_some() {
                usage = u;
            }
            log_client_error_if_any(upstream_status, &json_buf);
        }
        _ => {}
    }

    let _ = outcome_tx.send(PipelineOutcome {
        model,
        usage,
        stream_interrupted,
    });
}

/// Logs a sharper reason for a non-2xx JSON body once the Format Detection
/// layer has already confirmed it's structurally JSON. Purely diagnostic: it
/// never changes the retry/commit decision, which the dispatcher already
/// made from the status code alone.
fn log_client_error_if_any(upstream_status: u16, body: &str) {
    if let Some(reason) = explain_client_error(upstream_status, body) {
        warn!(status = upstream_status, reason = %reason, "upstream rejected request");
    }
}

fn apply_frame(
    event: &str,
    data: &str,
    model: &mut Option<String>,
    usage: &mut Option<TokenUsage>,
    stream_interrupted: &mut bool,
) {
    match parse_frame(event, data) {
        SseFrame::MessageStart { model: m } => {
            if m.is_some() {
                *model = m;
            }
        }
        // Last full usage object wins.
        SseFrame::Usage(u) => *usage = Some(u),
        SseFrame::Error => *stream_interrupted = true,
        SseFrame::Other => {}
    }
}

/// Cheap heuristic so a small, already-complete JSON response doesn't sit
/// in the peek buffer until the 64 KiB cap: once braces balance, it's safe
/// to run detection immediately.
fn is_probably_complete_json(buf: &str) -> bool {
    let trimmed = buf.trim();
    if !trimmed.starts_with('{') {
        return false;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_balanced_json_completion() {
        assert!(is_probably_complete_json(r#"{"a":{"b":1},"c":2}"#));
        assert!(!is_probably_complete_json(r#"{"a":{"b":1"#));
    }
}
