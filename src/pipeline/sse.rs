//! SSE frame parsing and JSON usage extraction.

use serde::Deserialize;
use serde_json::Value;

/// Token usage as reported on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(w: WireUsage) -> Self {
        Self {
            input_tokens: w.input_tokens,
            output_tokens: w.output_tokens,
            cache_creation_tokens: w.cache_creation_input_tokens,
            cache_read_tokens: w.cache_read_input_tokens,
        }
    }
}

/// Outcome of parsing one complete SSE frame.
pub enum SseFrame {
    MessageStart { model: Option<String> },
    Usage(TokenUsage),
    /// An `error` SSE event: the pipeline marks the request failed and stops
    /// recording tokens.
    Error,
    /// Recognized event name but nothing we track (ignored).
    Other,
}

/// Parses a single `event: <name>\ndata: <json>` frame (already split on the
/// blank-line frame boundary by the caller).
pub fn parse_frame(event_name: &str, data: &str) -> SseFrame {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseFrame::Other;
    };

    match event_name {
        "error" => SseFrame::Error,
        "message_start" => {
            let model = value
                .get("message")
                .and_then(|m| m.get("model"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string());
            SseFrame::MessageStart { model }
        }
        "message_delta" | "message_stop" => {
            let usage = value
                .get("usage")
                .cloned()
                .or_else(|| value.get("message").and_then(|m| m.get("usage")).cloned());
            match usage.and_then(|u| serde_json::from_value::<WireUsage>(u).ok()) {
                Some(u) => SseFrame::Usage(u.into()),
                None => SseFrame::Other,
            }
        }
        _ => SseFrame::Other,
    }
}

/// Incrementally splits an SSE byte stream into `(event, data)` frames
/// across chunk boundaries, since a frame can span more than one network
/// read.
#[derive(Default)]
pub struct SseFrameSplitter {
    buffer: String,
}

impl SseFrameSplitter {
    pub fn push(&mut self, chunk: &str) -> Vec<(String, String)> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(boundary) = self.buffer.find("\n\n") {
            let frame_text: String = self.buffer.drain(..boundary + 2).collect();
            let mut event_name = String::new();
            let mut data = String::new();
            for line in frame_text.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim());
                }
            }
            if !data.is_empty() {
                frames.push((event_name, data));
            }
        }
        frames
    }
}

/// Parses a single, fully-buffered JSON response body: one `model` + one
/// usage record.
pub fn parse_json_body(body: &str) -> (Option<String>, Option<TokenUsage>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, None);
    };
    let model = value.get("model").and_then(|m| m.as_str()).map(String::from);
    let usage = value
        .get("usage")
        .cloned()
        .and_then(|u| serde_json::from_value::<WireUsage>(u).ok())
        .map(TokenUsage::from);
    (model, usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frames_across_pushes() {
        let mut splitter = SseFrameSplitter::default();
        let mut frames = splitter.push("event: message_start\ndata: {\"mess");
        assert!(frames.is_empty());
        frames = splitter.push("age\":{\"model\":\"claude-3\"}}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "message_start");
    }

    #[test]
    fn message_start_extracts_model() {
        let data = r#"{"message":{"model":"claude-3-5-haiku-20241022"}}"#;
        match parse_frame("message_start", data) {
            SseFrame::MessageStart { model } => {
                assert_eq!(model.as_deref(), Some("claude-3-5-haiku-20241022"))
            }
            _ => panic!("expected MessageStart"),
        }
    }

    #[test]
    fn message_delta_extracts_usage() {
        let data = r#"{"usage":{"input_tokens":10,"output_tokens":20}}"#;
        match parse_frame("message_delta", data) {
            SseFrame::Usage(u) => {
                assert_eq!(u.input_tokens, 10);
                assert_eq!(u.output_tokens, 20);
            }
            _ => panic!("expected Usage"),
        }
    }

    #[test]
    fn error_event_is_recognized() {
        assert!(matches!(parse_frame("error", "{}"), SseFrame::Error));
    }

    #[test]
    fn json_body_parses_model_and_usage() {
        let body = r#"{"model":"claude-3-5-haiku-20241022","usage":{"input_tokens":10,"output_tokens":20}}"#;
        let (model, usage) = parse_json_body(body);
        assert_eq!(model.as_deref(), Some("claude-3-5-haiku-20241022"));
        let usage = usage.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
    }
}
