//! Lifecycle & Usage Tracker: per-request lifecycle state, cost calculation,
//! and a durable batched sink, grounded on the
//! dedicated-writer-thread pattern used for `aspy`'s lifetime-statistics
//! store (adapted here to a small pool of tokio writer tasks consuming a
//! bounded channel, since the rest of this crate is tokio-native rather
//! than thread-per-worker).

pub mod cost;
pub mod sink;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ModelRate, TrackerConfig};
use crate::dispatcher::SuspendTable;
use crate::pipeline::TokenUsage;
use cost::{compute_cost, RequestCost};

/// How many concurrent writer tasks drain the record queue. Kept small:
/// sqlite serializes writes anyway, so this mostly buys overlap between
/// "waiting on the next batch" and "committing the previous one".
const WRITER_POOL_SIZE: usize = 2;
const CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Forwarding,
    Processing,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Forwarding => "forwarding",
            RequestStatus::Processing => "processing",
            RequestStatus::Suspended => "suspended",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub status: RequestStatus,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: String,
    pub path: String,
    pub http_status_code: Option<i64>,
    pub retry_count: i64,
    pub duration_ms: Option<i64>,
    pub is_streaming: bool,
    pub usage: TokenUsage,
    pub cost: RequestCost,
    pub failure_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl RequestRecord {
    fn new(request_id: String, method: String, path: String, now_ms: i64) -> Self {
        Self {
            request_id,
            start_time_ms: now_ms,
            end_time_ms: None,
            status: RequestStatus::Pending,
            model: None,
            endpoint: None,
            group: None,
            client_ip: None,
            user_agent: None,
            method,
            path,
            http_status_code: None,
            retry_count: 0,
            duration_ms: None,
            is_streaming: false,
            usage: TokenUsage::default(),
            cost: RequestCost::default(),
            failure_reason: None,
            cancel_reason: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

#[derive(Default)]
pub struct TrackerMetrics {
    pub records_queued: AtomicU64,
    pub records_dropped: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub write_latency_us: AtomicU64,
}

impl TrackerMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.records_queued.load(Ordering::Relaxed),
            self.records_dropped.load(Ordering::Relaxed),
            self.batches_flushed.load(Ordering::Relaxed),
            self.write_latency_us.load(Ordering::Relaxed),
        )
    }
}

pub struct UsageTracker {
    active: Mutex<HashMap<String, RequestRecord>>,
    pricing: HashMap<String, ModelRate>,
    tx: mpsc::Sender<RequestRecord>,
    pool: sink::SinkPool,
    pub metrics: Arc<TrackerMetrics>,
}

impl UsageTracker {
    pub fn new(config: &TrackerConfig, pricing: HashMap<String, ModelRate>) -> Result<Arc<Self>> {
        let pool = sink::open_pool(&config.sink_path)?;
        let (tx, rx) = mpsc::channel::<RequestRecord>(CHANNEL_CAPACITY);
        let metrics = Arc::new(TrackerMetrics::default());

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..WRITER_POOL_SIZE {
            spawn_writer(
                worker,
                Arc::clone(&shared_rx),
                pool.clone(),
                config.batch_size,
                config.flush_interval,
                Arc::clone(&metrics),
            );
        }

        Ok(Arc::new(Self {
            active: Mutex::new(HashMap::new()),
            pricing,
            tx,
            pool,
            metrics,
        }))
    }

    pub fn query(&self, q: &sink::UsageQuery) -> Result<Vec<sink::UsageRow>> {
        sink::query_requests(&self.pool, q)
    }

    pub fn distinct(&self, column: &str) -> Result<Vec<String>> {
        sink::distinct_values(&self.pool, column)
    }

    fn enqueue(&self, record: RequestRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.metrics.records_queued.fetch_add(1, Ordering::Relaxed);
                counter!("relay_gateway_tracker_records_queued_total").increment(1);
            }
            Err(_) => {
                self.metrics.records_dropped.fetch_add(1, Ordering::Relaxed);
                counter!("relay_gateway_tracker_records_dropped_total").increment(1);
                warn!("tracker write queue full; dropping a record update");
            }
        }
    }

    fn with_record<F>(&self, request_id: &str, now_ms: i64, f: F)
    where
        F: FnOnce(&mut RequestRecord),
    {
        let mut active = self.active.lock().unwrap();
        if let Some(record) = active.get_mut(request_id) {
            f(record);
            record.updated_at_ms = now_ms;
            self.enqueue(record.clone());
        }
    }

    pub fn begin_request(
        &self,
        request_id: &str,
        method: &str,
        path: &str,
        client_ip: Option<String>,
        user_agent: Option<String>,
        now_ms: i64,
    ) {
        let mut record = RequestRecord::new(request_id.to_string(), method.to_string(), path.to_string(), now_ms);
        record.client_ip = client_ip;
        record.user_agent = user_agent;
        self.enqueue(record.clone());
        self.active.lock().unwrap().insert(request_id.to_string(), record);
    }

    pub fn mark_forwarding(&self, request_id: &str, endpoint: &str, group: &str, now_ms: i64) {
        self.with_record(request_id, now_ms, |r| {
            r.status = RequestStatus::Forwarding;
            r.endpoint = Some(endpoint.to_string());
            r.group = Some(group.to_string());
        });
    }

    pub fn mark_suspended(&self, request_id: &str, now_ms: i64) {
        self.with_record(request_id, now_ms, |r| {
            r.status = RequestStatus::Suspended;
        });
    }

    pub fn record_attempt(&self, request_id: &str, retry_count: i64, now_ms: i64) {
        self.with_record(request_id, now_ms, |r| {
            r.retry_count = retry_count;
        });
    }

    pub fn mark_processing(&self, request_id: &str, model: Option<String>, is_streaming: bool, now_ms: i64) {
        self.with_record(request_id, now_ms, |r| {
            r.status = RequestStatus::Processing;
            r.is_streaming = is_streaming;
            if model.is_some() {
                r.model = model;
            }
        });
    }

    /// Applies a freshly-parsed usage snapshot and recomputes cost. Called
    /// once per pipeline outcome, not incrementally, since the pipeline
    /// itself already enforces "last full usage object wins".
    pub fn record_tokens(&self, request_id: &str, usage: TokenUsage, now_ms: i64) {
        let mut active = self.active.lock().unwrap();
        if let Some(record) = active.get_mut(request_id) {
            record.usage = usage;
            if let Some(model) = &record.model {
                record.cost = compute_cost(model, &usage, &self.pricing).unwrap_or_default();
                if !self.pricing.contains_key(model) {
                    warn!(model = %model, "no pricing configured for model; costs recorded as zero");
                }
            }
            record.updated_at_ms = now_ms;
            self.enqueue(record.clone());
        }
    }

    pub fn finish_completed(&self, request_id: &str, http_status: i64, now_ms: i64) {
        self.finish(request_id, RequestStatus::Completed, Some(http_status), None, None, now_ms);
    }

    pub fn finish_failed(&self, request_id: &str, http_status: Option<i64>, reason: String, now_ms: i64) {
        self.finish(request_id, RequestStatus::Failed, http_status, Some(reason), None, now_ms);
    }

    pub fn finish_cancelled(&self, request_id: &str, reason: String, now_ms: i64) {
        self.finish(request_id, RequestStatus::Cancelled, None, None, Some(reason), now_ms);
    }

    pub fn finish_timeout(&self, request_id: &str, now_ms: i64) {
        self.finish(request_id, RequestStatus::TimedOut, None, None, None, now_ms);
    }

    fn finish(
        &self,
        request_id: &str,
        status: RequestStatus,
        http_status: Option<i64>,
        failure_reason: Option<String>,
        cancel_reason: Option<String>,
        now_ms: i64,
    ) {
        counter!("relay_gateway_requests_finished_total", "status" => status.as_str()).increment(1);

        let mut active = self.active.lock().unwrap();
        if let Some(mut record) = active.remove(request_id) {
            record.status = status;
            record.end_time_ms = Some(now_ms);
            record.duration_ms = Some(now_ms - record.start_time_ms);
            if http_status.is_some() {
                record.http_status_code = http_status;
            }
            record.failure_reason = failure_reason;
            record.cancel_reason = cancel_reason;
            record.updated_at_ms = now_ms;
            self.enqueue(record);
        }
    }

    /// Polls the dispatcher's orphaned-cancellation channel and finalizes
    /// those records as `cancelled`, covering the client-disconnect-while-
    /// suspended path that no dispatcher code observes directly.
    pub async fn reconcile_orphaned_cancellations(&self, suspend_table: &Arc<SuspendTable>, now_ms: i64) {
        for request_id in suspend_table.drain_orphaned_cancellations().await {
            self.finish_cancelled(&request_id, "client disconnected while suspended".to_string(), now_ms);
        }
    }
}

fn spawn_writer(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RequestRecord>>>,
    pool: sink::SinkPool,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Arc<TrackerMetrics>,
) {
    tokio::spawn(async move {
        let mut batch: Vec<RequestRecord> = Vec::with_capacity(batch_size);
        loop {
            let mut guard = rx.lock().await;
            let deadline = tokio::time::sleep(flush_interval);
            tokio::pin!(deadline);

            let mut closed = false;
            while batch.len() < batch_size {
                tokio::select! {
                    item = guard.recv() => {
                        match item {
                            Some(record) => batch.push(record),
                            None => { closed = true; break; }
                        }
                    }
                    _ = &mut deadline => break,
                }
            }
            drop(guard);

            if !batch.is_empty() {
                let started = std::time::Instant::now();
                if let Err(err) = sink::upsert_batch(&pool, &batch) {
                    warn!(worker = worker_id, error = %err, "tracker batch write failed");
                } else {
                    debug!(worker = worker_id, count = batch.len(), "flushed tracker batch");
                }
                let latency_us = started.elapsed().as_micros() as u64;
                metrics.write_latency_us.store(latency_us, Ordering::Relaxed);
                metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
                histogram!("relay_gateway_tracker_write_latency_us").record(latency_us as f64);
                counter!("relay_gateway_tracker_batches_flushed_total").increment(1);
                batch.clear();
            }

            if closed {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn tmp_tracker() -> (Arc<UsageTracker>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.sqlite3");
        let config = TrackerConfig {
            sink_path: path,
            batch_size: 4,
            flush_interval: Duration::from_millis(20),
        };
        (UsageTracker::new(&config, Map::new()).unwrap(), dir)
    }

    #[tokio::test]
    async fn lifecycle_transitions_remove_record_from_active_map_on_finish() {
        let (tracker, _dir) = tmp_tracker();
        tracker.begin_request("req-1", "POST", "/v1/messages", None, None, 1_000);
        tracker.mark_forwarding("req-1", "ep-a", "main", 1_001);
        tracker.mark_processing("req-1", Some("claude-3-5-haiku-20241022".to_string()), true, 1_002);
        tracker.finish_completed("req-1", 200, 1_050);
        assert!(!tracker.active.lock().unwrap().contains_key("req-1"));
    }

    #[tokio::test]
    async fn unknown_request_id_updates_are_ignored() {
        let (tracker, _dir) = tmp_tracker();
        // No begin_request call; these should be silent no-ops, not panics.
        tracker.mark_forwarding("ghost", "ep-a", "main", 1_000);
        tracker.finish_completed("ghost", 200, 1_010);
    }
}
