//! Three-layer format detection.
//!
//! Exists to fix a real bug: a JSON response whose body contains a tool-use
//! argument with SSE-looking example strings (`"event: message_start"`)
//! must be classified JSON, not SSE. Structural JSON is checked first and
//! wins outright; SSE is only considered once JSON has been ruled out.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFormat {
    Json,
    Sse,
    NoTokens,
}

/// Layer 1: trimmed content starts with `{`, ends with `}`, and parses as a
/// JSON object.
fn is_structural_json(body: &str) -> bool {
    let trimmed = body.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return false;
    }
    matches!(
        serde_json::from_str::<serde_json::Value>(trimmed),
        Ok(serde_json::Value::Object(_))
    )
}

/// Layer 2: SSE-prefixed lines must be >50% of non-empty lines, with at
/// least one such line.
fn is_structural_sse(body: &str) -> bool {
    let lines: Vec<&str> = body.split('\n').filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return false;
    }
    let sse_lines = lines
        .iter()
        .filter(|l| l.starts_with("event:") || l.starts_with("data:"))
        .count();
    sse_lines >= 1 && (sse_lines as f64) / (lines.len() as f64) > 0.5
}

/// Layer 3: lenient fallback based on substring sniffing.
fn fallback_format(body: &str) -> DetectedFormat {
    if body.contains("\"usage\"") {
        DetectedFormat::Json
    } else if body.contains("event:") || body.contains("data:") {
        DetectedFormat::Sse
    } else {
        DetectedFormat::NoTokens
    }
}

/// Runs all three layers against a buffered body (JSON mode) or a single
/// chunk (SSE mode).
pub fn detect_format(body: &str) -> DetectedFormat {
    if is_structural_json(body) {
        return DetectedFormat::Json;
    }
    if is_structural_sse(body) {
        return DetectedFormat::Sse;
    }
    fallback_format(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_wins_even_when_it_contains_sse_literals() {
        let body = r#"{"type":"message","content":[{"type":"tool_use","input":{"command":"echo 'event: message_start\ndata: {}'"}}],"usage":{"input_tokens":1,"output_tokens":2}}"#;
        assert_eq!(detect_format(body), DetectedFormat::Json);
    }

    #[test]
    fn structural_sse_detected_by_line_ratio() {
        let body = "event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: message_stop\ndata: {}\n\n";
        assert_eq!(detect_format(body), DetectedFormat::Sse);
    }

    #[test]
    fn fallback_to_no_tokens_when_nothing_recognizable() {
        assert_eq!(detect_format("plain text body"), DetectedFormat::NoTokens);
    }

    #[test]
    fn fallback_json_when_usage_substring_present_but_not_structurally_clean() {
        let body = "garbage-prefix {\"usage\":{\"input_tokens\":1}} garbage-suffix";
        assert_eq!(detect_format(body), DetectedFormat::Json);
    }
}
