//! Diagnostic classification of upstream error responses.
//!
//! This sharpens *why* a 4xx happened for logging and the lifecycle
//! record's `failure_reason`; it never overrides the retry decision, which
//! is status-code-range based only (4xx except 408/429 is always
//! non-retryable regardless of what this returns).

use serde_json::Value;

fn extract_error_type(v: &Value) -> Option<String> {
    if let Some(err) = v.get("error") {
        if let Some(t) = err.get("type").and_then(|x| x.as_str()) {
            return Some(t.to_string());
        }
        if let Some(t) = err.get("code").and_then(|x| x.as_str()) {
            return Some(t.to_string());
        }
    }
    v.get("type")
        .and_then(|x| x.as_str())
        .filter(|t| *t == "error")
        .and_then(|_| v.get("error"))
        .and_then(|err| err.get("type"))
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
}

/// A best-effort explanation for a non-2xx upstream body, used only to
/// enrich diagnostics (tracing fields). Called from the Response Pipeline's
/// JSON path, which has already confirmed the body is structurally JSON
/// before this ever runs.
pub fn explain_client_error(status: u16, body: &str) -> Option<String> {
    if !(400..500).contains(&status) || body.is_empty() {
        return None;
    }
    let v: Value = serde_json::from_str(body).ok()?;
    let error_type = extract_error_type(&v)?;
    let lower = error_type.to_ascii_lowercase();
    let recognized = matches!(
        lower.as_str(),
        "invalid_request_error"
            | "validation_error"
            | "bad_request"
            | "context_limit"
            | "context_length_exceeded"
            | "token_limit"
            | "content_filter"
    );
    recognized.then_some(error_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_anthropic_style_error_type() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#;
        assert_eq!(
            explain_client_error(400, body),
            Some("invalid_request_error".to_string())
        );
    }

    #[test]
    fn ignores_unrecognized_error_types() {
        let body = r#"{"error":{"type":"permission_denied"}}"#;
        assert_eq!(explain_client_error(403, body), None);
    }

    #[test]
    fn non_4xx_status_is_never_explained() {
        let body = r#"{"error":{"type":"invalid_request_error"}}"#;
        assert_eq!(explain_client_error(500, body), None);
    }
}
