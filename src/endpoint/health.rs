//! Health probing.
//!
//! One task per endpoint on a fixed interval, concurrency-bounded the same
//! way the teacher bounds its config-level health sweep: a semaphore caps
//! how many probes are in flight at once so a large endpoint pool doesn't
//! open hundreds of sockets in the same tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use super::manager::EndpointManager;

const MAX_CONCURRENT_PROBES: usize = 16;

pub struct ProbeOutcome {
    pub ok: bool,
    pub elapsed: Duration,
}

#[instrument(skip(client, url), fields(url = %url))]
async fn probe_once(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeOutcome {
    let start = Instant::now();
    let result = client.get(url).timeout(timeout).send().await;
    let elapsed = start.elapsed();
    match result {
        Ok(resp) => ProbeOutcome {
            ok: resp.status().is_success(),
            elapsed,
        },
        Err(err) => {
            warn!(error = %err, "health probe failed");
            ProbeOutcome { ok: false, elapsed }
        }
    }
}

/// Spawns the background prober. Runs until the manager is dropped (the
/// `Arc` keeps it alive for as long as any clone, including this task's own
/// closure, survives).
pub fn spawn_prober(manager: Arc<EndpointManager>, health_path: String, check_interval: Duration) {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .build()
            .expect("building health-probe http client");

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            manager.sweep_cooldowns();
            let names = manager.endpoint_names();
            let mut handles = Vec::with_capacity(names.len());
            for name in names {
                let manager = Arc::clone(&manager);
                let client = client.clone();
                let semaphore = Arc::clone(&semaphore);
                let health_path = health_path.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    probe_named_endpoint(&manager, &client, &name, &health_path).await;
                }));
            }
            for h in handles {
                let _ = h.await;
            }
        }
    });
}

async fn probe_named_endpoint(
    manager: &Arc<EndpointManager>,
    client: &reqwest::Client,
    name: &str,
    health_path: &str,
) {
    let Some((url, timeout)) = manager.endpoint_probe_target(name) else {
        return;
    };
    let full_url = format!("{url}{health_path}");
    let outcome = probe_once(client, &full_url, timeout).await;
    record_probe_metrics(name, &outcome);
    manager.record_probe_result(name, outcome.ok, outcome.elapsed);
}

fn record_probe_metrics(endpoint: &str, outcome: &ProbeOutcome) {
    histogram!("relay_gateway_health_probe_duration_ms", "endpoint" => endpoint.to_string())
        .record(outcome.elapsed.as_secs_f64() * 1000.0);
    if outcome.ok {
        counter!("relay_gateway_health_probe_success_total", "endpoint" => endpoint.to_string()).increment(1);
    } else {
        counter!("relay_gateway_health_probe_failure_total", "endpoint" => endpoint.to_string()).increment(1);
    }
}

/// Forces a single immediate probe of one endpoint, used by the operator API
/// `POST /api/v1/endpoints/{name}/health-check`.
pub async fn probe_now(manager: &Arc<EndpointManager>, health_path: &str, name: &str) -> bool {
    let Some((url, timeout)) = manager.endpoint_probe_target(name) else {
        return false;
    };
    let client = reqwest::Client::new();
    let full_url = format!("{url}{health_path}");
    let outcome = probe_once(&client, &full_url, timeout).await;
    record_probe_metrics(name, &outcome);
    manager.record_probe_result(name, outcome.ok, outcome.elapsed);
    true
}
