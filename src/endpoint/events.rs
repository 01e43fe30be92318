//! Event bus for endpoint/group state changes.
//!
//! Low-frequency events (activate/pause/resume) are delivered immediately.
//! High-frequency `HealthStats` deltas are coalesced to at most one per
//! second per group: callers that publish faster than that simply overwrite
//! the pending delta rather than queueing every one, so slow subscribers
//! never back-pressure publishers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

const HEALTH_STATS_COALESCE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum EndpointEvent {
    GroupActivated { group: String },
    GroupPaused { group: String },
    GroupResumed { group: String },
    GroupEnteredCooldown { group: String },
    GroupLeftCooldown { group: String },
    HealthStats {
        group: String,
        healthy_count: usize,
        total_count: usize,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<EndpointEvent>,
    last_health_emit: Mutex<HashMap<String, Instant>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            last_health_emit: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.sender.subscribe()
    }

    /// Delivered immediately, no coalescing.
    pub fn publish(&self, event: EndpointEvent) {
        // A broadcast channel with no receivers returns Err; that's fine,
        // there's nobody listening on the operator side yet.
        let _ = self.sender.send(event);
    }

    /// Coalesced to at most one emission per second per group.
    pub fn publish_health_stats(&self, group: &str, healthy_count: usize, total_count: usize) {
        let now = Instant::now();
        let mut last = self.last_health_emit.lock().unwrap();
        let should_emit = match last.get(group) {
            Some(t) => now.duration_since(*t) >= HEALTH_STATS_COALESCE_WINDOW,
            None => true,
        };
        if should_emit {
            last.insert(group.to_string(), now);
            drop(last);
            self.publish(EndpointEvent::HealthStats {
                group: group.to_string(),
                healthy_count,
                total_count,
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_stats_coalesce_within_window() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish_health_stats("main", 2, 3);
        bus.publish_health_stats("main", 1, 3);
        // Second call lands inside the coalescing window and is dropped.
        let received = rx.try_recv().unwrap();
        match received {
            EndpointEvent::HealthStats { healthy_count, .. } => assert_eq!(healthy_count, 2),
            _ => panic!("unexpected event"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn low_frequency_events_are_never_coalesced() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EndpointEvent::GroupActivated {
            group: "main".to_string(),
        });
        bus.publish(EndpointEvent::GroupPaused {
            group: "main".to_string(),
        });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
