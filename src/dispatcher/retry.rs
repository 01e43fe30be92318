//! Retry backoff policy: exponential backoff with an optional `Retry-After`
//! override.

use axum::http::HeaderMap;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::RetryConfig;

/// `baseDelay × multiplier^(attempt-1)` capped at `maxDelay`.
/// `attempt_index` is 0-based (the delay *before* the next attempt).
pub fn backoff_delay(cfg: &RetryConfig, attempt_index: u32) -> Duration {
    let factor = cfg.multiplier.max(1.0).powi(attempt_index as i32);
    let millis = (cfg.base_delay.as_millis() as f64 * factor) as u64;
    Duration::from_millis(millis).min(cfg.max_delay)
}

fn retry_after_duration(headers: &HeaderMap, cap: Duration) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    let seconds: u64 = raw.parse().ok()?;
    Some(Duration::from_secs(seconds).min(cap.max(Duration::from_secs(1))))
}

/// Sleeps between retry attempts, honoring a `Retry-After` response header
/// over the exponential backoff schedule when present.
pub async fn sleep_before_retry(cfg: &RetryConfig, attempt_index: u32, resp_headers: Option<&HeaderMap>) {
    let delay = resp_headers
        .and_then(|h| retry_after_duration(h, cfg.max_delay))
        .unwrap_or_else(|| backoff_delay(cfg, attempt_index));
    if delay.is_zero() {
        return;
    }
    // Small jitter keeps a pool of simultaneously-retrying clients from
    // re-hammering the same endpoint in lockstep.
    let jitter_ms = rand::thread_rng().gen_range(0..=50u64);
    sleep(delay + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn cfg() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: StdDuration::from_millis(100),
            max_delay: StdDuration::from_secs(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let c = cfg();
        assert_eq!(backoff_delay(&c, 0), StdDuration::from_millis(100));
        assert_eq!(backoff_delay(&c, 1), StdDuration::from_millis(200));
        assert_eq!(backoff_delay(&c, 2), StdDuration::from_millis(400));
        assert_eq!(backoff_delay(&c, 10), StdDuration::from_secs(2));
    }

    #[test]
    fn retry_after_header_parses_and_caps() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "10".parse().unwrap());
        let got = retry_after_duration(&headers, StdDuration::from_secs(2)).unwrap();
        assert_eq!(got, StdDuration::from_secs(2));
    }

    #[test]
    fn missing_retry_after_returns_none() {
        let headers = HeaderMap::new();
        assert!(retry_after_duration(&headers, StdDuration::from_secs(2)).is_none());
    }
}
