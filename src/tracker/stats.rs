//! Window-stats aggregation for the operator dashboard, adapted from the
//! percentile-via-`select_nth_unstable` pattern used for request-latency
//! dashboards elsewhere in this codebase.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::sink::UsageRow;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WindowStats {
    pub total: usize,
    pub ok_2xx: usize,
    pub err_429: usize,
    pub err_4xx: usize,
    pub err_5xx: usize,
    pub p50_ms: Option<i64>,
    pub p95_ms: Option<i64>,
    pub avg_attempts: Option<f64>,
    pub retry_rate: Option<f64>,
    pub total_cost: f64,
    pub top_endpoint: Option<(String, usize)>,
    pub top_group: Option<(String, usize)>,
}

fn percentile(mut v: Vec<i64>, p: f64) -> Option<i64> {
    if v.is_empty() {
        return None;
    }
    let n = v.len();
    let idx = ((p * (n.saturating_sub(1) as f64)).ceil() as usize).min(n - 1);
    let (_, nth, _) = v.select_nth_unstable(idx);
    Some(*nth)
}

/// Aggregates a set of already-queried rows (the caller is expected to have
/// filtered by time range via `sink::UsageQuery`; `window_stats` only slices
/// by status code buckets and computes the derived metrics).
pub fn compute_window_stats(rows: &[UsageRow]) -> WindowStats {
    let mut out = WindowStats::default();
    let mut ok_lat = Vec::new();
    let mut attempts_sum: u64 = 0;
    let mut retry_cnt: u64 = 0;

    let mut by_endpoint: HashMap<String, usize> = HashMap::new();
    let mut by_group: HashMap<String, usize> = HashMap::new();

    for row in rows {
        out.total += 1;
        out.total_cost += row.total_cost;

        let attempts = (row.retry_count + 1).max(1) as u64;
        attempts_sum = attempts_sum.saturating_add(attempts);
        if row.retry_count > 0 {
            retry_cnt = retry_cnt.saturating_add(1);
        }

        let status = row.http_status_code.unwrap_or(0);
        if status == 429 {
            out.err_429 += 1;
        } else if (400..500).contains(&status) {
            out.err_4xx += 1;
        } else if (500..600).contains(&status) {
            out.err_5xx += 1;
        }

        if (200..300).contains(&status) {
            out.ok_2xx += 1;
            if let Some(d) = row.duration_ms {
                ok_lat.push(d);
            }
            if let Some(ep) = &row.endpoint {
                *by_endpoint.entry(ep.clone()).or_insert(0) += 1;
            }
            if let Some(g) = &row.group {
                *by_group.entry(g.clone()).or_insert(0) += 1;
            }
        }
    }

    out.p50_ms = percentile(ok_lat.clone(), 0.50);
    out.p95_ms = percentile(ok_lat, 0.95);
    if out.total > 0 {
        out.avg_attempts = Some(attempts_sum as f64 / out.total as f64);
        out.retry_rate = Some(retry_cnt as f64 / out.total as f64);
    }

    out.top_endpoint = by_endpoint.into_iter().max_by_key(|(_, v)| *v);
    out.top_group = by_group.into_iter().max_by_key(|(_, v)| *v);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: i64, duration_ms: i64, retry_count: i64, endpoint: &str) -> UsageRow {
        UsageRow {
            request_id: "r".to_string(),
            start_time_ms: 0,
            end_time_ms: Some(duration_ms),
            status: "completed".to_string(),
            model: None,
            endpoint: Some(endpoint.to_string()),
            group: Some("main".to_string()),
            http_status_code: Some(status),
            retry_count,
            duration_ms: Some(duration_ms),
            total_cost: 0.01,
        }
    }

    #[test]
    fn buckets_status_codes_and_computes_percentiles() {
        let rows = vec![
            row(200, 100, 0, "ep-a"),
            row(200, 200, 1, "ep-a"),
            row(200, 300, 0, "ep-b"),
            row(429, 50, 2, "ep-a"),
            row(503, 10, 0, "ep-a"),
        ];
        let stats = compute_window_stats(&rows);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.ok_2xx, 3);
        assert_eq!(stats.err_429, 1);
        assert_eq!(stats.err_5xx, 1);
        assert!(stats.p50_ms.is_some());
        assert_eq!(stats.top_endpoint, Some(("ep-a".to_string(), 2)));
        let retry_rate = stats.retry_rate.unwrap();
        assert!((retry_rate - 2.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn empty_input_yields_none_percentiles_without_panicking() {
        let stats = compute_window_stats(&[]);
        assert_eq!(stats.total, 0);
        assert!(stats.p50_ms.is_none());
        assert!(stats.avg_attempts.is_none());
    }
}
