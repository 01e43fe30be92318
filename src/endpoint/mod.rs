//! Endpoint & Group Manager.
//!
//! Owns endpoint/group state, runs the health prober, and answers
//! `select_candidates()` for the dispatcher. This is the single source of
//! truth for endpoint health; it is passed explicitly into the dispatcher,
//! the health prober, and the operator API rather than hidden behind a
//! process-global.

mod events;
mod group;
mod health;
mod manager;

pub use events::{EndpointEvent, EventBus};
pub use group::{Group, GroupState};
pub use health::{probe_now, spawn_prober};
pub use manager::EndpointManager;

use std::time::{Duration, Instant};

/// Immutable identity plus mutable health status for one upstream.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub group: String,
    pub group_priority: u32,
    pub priority: u32,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub timeout: Duration,
    pub supported_models: std::collections::HashMap<String, bool>,
    pub model_mapping: std::collections::HashMap<String, String>,

    pub healthy: bool,
    pub last_check: Option<Instant>,
    pub response_time: Option<Duration>,
    pub consecutive_fails: u32,
    pub never_checked: bool,
}

impl Endpoint {
    pub fn from_config(cfg: &crate::config::EndpointConfig, default_timeout: Duration) -> Self {
        Self {
            name: cfg.name.clone(),
            url: cfg.url.trim_end_matches('/').to_string(),
            group: cfg.group.clone(),
            group_priority: cfg.group_priority,
            priority: cfg.priority,
            token: cfg.token.clone(),
            token_env: cfg.token_env.clone(),
            timeout: cfg.timeout.unwrap_or(default_timeout),
            supported_models: cfg.supported_models.clone(),
            model_mapping: cfg.model_mapping.clone(),
            healthy: false,
            last_check: None,
            response_time: None,
            consecutive_fails: 0,
            never_checked: true,
        }
    }

    /// `(groupPriority asc, priority asc, name asc)`.
    fn ordering_key(&self) -> (u32, u32, &str) {
        (self.group_priority, self.priority, self.name.as_str())
    }

    pub fn resolve_token(&self) -> Option<String> {
        if let Some(t) = self.token.as_deref()
            && !t.trim().is_empty()
        {
            return Some(t.to_string());
        }
        if let Some(env_name) = self.token_env.as_deref()
            && let Ok(v) = std::env::var(env_name)
            && !v.trim().is_empty()
        {
            return Some(v);
        }
        None
    }

    pub fn supports_model(&self, model: &str) -> bool {
        if self.supported_models.is_empty() {
            return true;
        }
        if let Some(allowed) = self.supported_models.get(model) {
            return *allowed;
        }
        self.supported_models
            .iter()
            .any(|(pattern, allowed)| *allowed && crate::config::wildcard_match(pattern, model))
    }

    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// Applies a completed probe result.
    fn record_probe(&mut self, ok: bool, elapsed: Duration) {
        self.last_check = Some(Instant::now());
        if ok {
            self.healthy = true;
            self.consecutive_fails = 0;
            self.response_time = Some(elapsed);
        } else {
            self.consecutive_fails += 1;
            // healthy only flips false once the first probe has completed;
            // never_checked guards that transition.
            if !self.never_checked {
                self.healthy = false;
            }
        }
        self.never_checked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(name: &str, gp: u32, p: u32) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            url: "https://x".to_string(),
            group: "g".to_string(),
            group_priority: gp,
            priority: p,
            token: None,
            token_env: None,
            timeout: Duration::from_secs(1),
            supported_models: Default::default(),
            model_mapping: Default::default(),
            healthy: false,
            last_check: None,
            response_time: None,
            consecutive_fails: 0,
            never_checked: true,
        }
    }

    #[test]
    fn ordering_key_sorts_group_priority_then_priority_then_name() {
        let mut v = vec![ep("c", 1, 0), ep("a", 0, 5), ep("b", 0, 1)];
        v.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        let names: Vec<&str> = v.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn never_checked_stays_true_until_first_probe_completes() {
        let mut e = ep("a", 0, 0);
        assert!(e.never_checked);
        assert!(!e.healthy);
        e.record_probe(false, Duration::from_millis(1));
        assert!(!e.never_checked);
        // first probe failed; healthy was already false so invariant holds.
        assert!(!e.healthy);
        assert_eq!(e.consecutive_fails, 1);
    }

    #[test]
    fn successful_probe_resets_consecutive_fails() {
        let mut e = ep("a", 0, 0);
        e.consecutive_fails = 4;
        e.never_checked = false;
        e.record_probe(true, Duration::from_millis(5));
        assert!(e.healthy);
        assert_eq!(e.consecutive_fails, 0);
        assert_eq!(e.response_time, Some(Duration::from_millis(5)));
    }

    #[test]
    fn unhealthy_does_not_flip_before_first_completed_probe() {
        let mut e = ep("a", 0, 0);
        // Manually simulate "in flight" probe state being read mid-probe:
        // never_checked must remain true and healthy false until record_probe runs.
        assert!(e.never_checked && !e.healthy);
    }
}
