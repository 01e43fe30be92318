//! `EndpointManager`: the single source of truth for endpoint/group state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::GatewayConfig;

use super::events::{EndpointEvent, EventBus};
use super::group::{Group, GroupState};
use super::Endpoint;

pub struct EndpointManager {
    endpoints: RwLock<Vec<Endpoint>>,
    groups: RwLock<HashMap<String, Group>>,
    events: EventBus,
    auto_switch: bool,
    cooldown: Duration,
}

impl EndpointManager {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        let default_timeout = config.health.timeout;
        let endpoints: Vec<Endpoint> = config
            .endpoints
            .iter()
            .map(|e| Endpoint::from_config(e, default_timeout))
            .collect();

        let mut groups: HashMap<String, Group> = HashMap::new();
        for ep in &endpoints {
            groups
                .entry(ep.group.clone())
                .or_insert_with(|| Group::new(ep.group.clone(), ep.group_priority));
            let g = groups.get_mut(&ep.group).unwrap();
            g.total_count += 1;
        }

        let manager = Arc::new(Self {
            endpoints: RwLock::new(endpoints),
            groups: RwLock::new(groups),
            events: EventBus::new(),
            auto_switch: config.group.auto_switch_between_groups,
            cooldown: config.group.cooldown,
        });

        // Activate the highest-priority group up front so a freshly started
        // gateway in auto mode doesn't sit fully paused until the first
        // health-derived transition.
        if manager.auto_switch {
            manager.try_auto_promote();
        }

        manager
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn endpoint_probe_target(&self, name: &str) -> Option<(String, Duration)> {
        self.endpoints
            .read()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .map(|e| (e.url.clone(), e.timeout))
    }

    /// Healthy endpoints of the active group, ordered by
    /// `(groupPriority, priority, name)`. A snapshot — the caller's `Vec` is
    /// never mutated by later state changes.
    pub fn select_candidates(&self) -> Vec<Endpoint> {
        let active_group = {
            let groups = self.groups.read().unwrap();
            groups
                .values()
                .find(|g| g.is_active())
                .map(|g| g.name.clone())
        };
        let Some(active_group) = active_group else {
            return Vec::new();
        };

        let endpoints = self.endpoints.read().unwrap();
        let mut candidates: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| e.healthy && e.group == active_group)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.group_priority, a.priority, a.name.as_str())
                .cmp(&(b.group_priority, b.priority, b.name.as_str()))
        });
        candidates
    }

    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().unwrap().clone()
    }

    pub fn list_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.groups.read().unwrap().values().cloned().collect();
        groups.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        groups
    }

    pub fn set_priority(&self, name: &str, priority: u32) -> bool {
        let mut endpoints = self.endpoints.write().unwrap();
        if let Some(e) = endpoints.iter_mut().find(|e| e.name == name) {
            e.priority = priority;
            true
        } else {
            false
        }
    }

    /// Applies a completed health probe and runs the group state machine.
    pub fn record_probe_result(&self, name: &str, ok: bool, elapsed: Duration) {
        let group_name = {
            let mut endpoints = self.endpoints.write().unwrap();
            let Some(e) = endpoints.iter_mut().find(|e| e.name == name) else {
                return;
            };
            e.record_probe(ok, elapsed);
            e.group.clone()
        };
        self.recompute_group_health(&group_name);
    }

    fn recompute_group_health(&self, group_name: &str) {
        let (healthy_count, total_count) = {
            let endpoints = self.endpoints.read().unwrap();
            let total = endpoints.iter().filter(|e| e.group == group_name).count();
            let healthy = endpoints
                .iter()
                .filter(|e| e.group == group_name && e.healthy)
                .count();
            (healthy, total)
        };

        let became_empty = {
            let mut groups = self.groups.write().unwrap();
            let Some(g) = groups.get_mut(group_name) else {
                return;
            };
            g.healthy_count = healthy_count;
            g.total_count = total_count;
            g.is_active() && healthy_count == 0
        };

        self.events
            .publish_health_stats(group_name, healthy_count, total_count);

        if became_empty {
            self.enter_cooldown(group_name);
        }

        if self.auto_switch {
            self.try_auto_promote();
        }
    }

    /// `active → cooldown` on `health→0`.
    fn enter_cooldown(&self, group_name: &str) {
        {
            let mut groups = self.groups.write().unwrap();
            let Some(g) = groups.get_mut(group_name) else {
                return;
            };
            g.state = GroupState::InCooldown;
            g.cooldown_until = Some(Instant::now() + self.cooldown);
        }
        info!(group = group_name, "group entered cooldown");
        self.events.publish(EndpointEvent::GroupEnteredCooldown {
            group: group_name.to_string(),
        });
    }

    /// `cooldown → paused` once `now ≥ cooldownUntil`.
    /// Called lazily from the manager's periodic sweep; see
    /// [`EndpointManager::sweep_cooldowns`].
    pub fn sweep_cooldowns(&self) {
        let now = Instant::now();
        let elapsed_groups: Vec<String> = {
            let groups = self.groups.read().unwrap();
            groups
                .values()
                .filter(|g| g.state == GroupState::InCooldown && g.cooldown_elapsed(now))
                .map(|g| g.name.clone())
                .collect()
        };
        for name in &elapsed_groups {
            {
                let mut groups = self.groups.write().unwrap();
                if let Some(g) = groups.get_mut(name) {
                    g.state = GroupState::Paused;
                    g.cooldown_until = None;
                }
            }
            self.events.publish(EndpointEvent::GroupLeftCooldown {
                group: name.clone(),
            });
        }
        if !elapsed_groups.is_empty() && self.auto_switch {
            self.try_auto_promote();
        }
    }

    fn deactivate_current(&self, groups: &mut HashMap<String, Group>) {
        for g in groups.values_mut() {
            if g.is_active() {
                g.state = GroupState::Paused;
            }
        }
    }

    /// `paused --activate(healthy>0)--> active`.
    pub fn activate_group(&self, name: &str) -> Result<(), &'static str> {
        let mut groups = self.groups.write().unwrap();
        let can = groups
            .get(name)
            .map(|g| g.can_activate())
            .ok_or("unknown group")?;
        if !can {
            return Err("group cannot be activated: no healthy endpoints or already active/in cooldown");
        }
        self.deactivate_current(&mut groups);
        let g = groups.get_mut(name).unwrap();
        g.state = GroupState::Active;
        g.force_activated = false;
        drop(groups);
        self.events.publish(EndpointEvent::GroupActivated {
            group: name.to_string(),
        });
        Ok(())
    }

    /// `paused --forceActivate--> active`, ignoring the `healthy>0`
    /// precondition.
    pub fn force_activate_group(&self, name: &str) -> Result<(), &'static str> {
        let mut groups = self.groups.write().unwrap();
        if !groups.contains_key(name) {
            return Err("unknown group");
        }
        self.deactivate_current(&mut groups);
        let g = groups.get_mut(name).unwrap();
        g.state = GroupState::Active;
        g.force_activated = true;
        g.cooldown_until = None;
        drop(groups);
        self.events.publish(EndpointEvent::GroupActivated {
            group: name.to_string(),
        });
        Ok(())
    }

    /// `active --pause--> paused`; wakes suspended requests so they
    /// re-evaluate.
    pub fn pause_group(&self, name: &str) -> Result<(), &'static str> {
        {
            let mut groups = self.groups.write().unwrap();
            let g = groups.get_mut(name).ok_or("unknown group")?;
            g.state = GroupState::Paused;
            g.manually_paused = true;
            g.force_activated = false;
        }
        self.events.publish(EndpointEvent::GroupPaused {
            group: name.to_string(),
        });
        Ok(())
    }

    /// `paused --resume--> paused`, clearing `manuallyPaused` so auto-promote
    /// can consider it again.
    pub fn resume_group(&self, name: &str) -> Result<(), &'static str> {
        {
            let mut groups = self.groups.write().unwrap();
            let g = groups.get_mut(name).ok_or("unknown group")?;
            g.manually_paused = false;
        }
        self.events.publish(EndpointEvent::GroupResumed {
            group: name.to_string(),
        });
        if self.auto_switch {
            self.try_auto_promote();
        }
        Ok(())
    }

    /// Auto mode: promote the highest-priority non-paused group with
    /// `healthyCount>0` whenever nothing is active.
    fn try_auto_promote(&self) {
        let already_active = {
            let groups = self.groups.read().unwrap();
            groups.values().any(|g| g.is_active())
        };
        if already_active {
            return;
        }

        let candidate = {
            let groups = self.groups.read().unwrap();
            groups
                .values()
                .filter(|g| {
                    g.state == GroupState::Paused && !g.manually_paused && g.healthy_count > 0
                })
                .min_by_key(|g| g.priority)
                .map(|g| g.name.clone())
        };

        if let Some(name) = candidate {
            let _ = self.activate_group(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, GatewayConfig, GroupConfig};

    fn config_with_two_groups() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.group = GroupConfig {
            auto_switch_between_groups: true,
            cooldown: Duration::from_millis(50),
        };
        cfg.endpoints = vec![
            EndpointConfig {
                name: "a1".into(),
                url: "https://a1".into(),
                group: "main".into(),
                group_priority: 0,
                priority: 0,
                token: None,
                token_env: None,
                timeout: None,
                supported_models: Default::default(),
                model_mapping: Default::default(),
            },
            EndpointConfig {
                name: "b1".into(),
                url: "https://b1".into(),
                group: "backup".into(),
                group_priority: 1,
                priority: 0,
                token: None,
                token_env: None,
                timeout: None,
                supported_models: Default::default(),
                model_mapping: Default::default(),
            },
        ];
        cfg
    }

    #[test]
    fn select_candidates_empty_when_no_group_active() {
        let cfg = config_with_two_groups();
        let mgr = EndpointManager::new(&cfg);
        assert!(mgr.select_candidates().is_empty());
    }

    #[test]
    fn auto_promotes_on_health_recovery_and_selects_healthy_only() {
        let cfg = config_with_two_groups();
        let mgr = EndpointManager::new(&cfg);
        mgr.record_probe_result("a1", true, Duration::from_millis(1));
        let candidates = mgr.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "a1");
    }

    #[test]
    fn active_group_enters_cooldown_when_its_last_endpoint_fails() {
        let cfg = config_with_two_groups();
        let mgr = EndpointManager::new(&cfg);
        mgr.record_probe_result("a1", true, Duration::from_millis(1));
        assert!(mgr.select_candidates().iter().any(|e| e.name == "a1"));

        mgr.record_probe_result("a1", false, Duration::from_millis(1));
        // "main" should now be in cooldown and have zero candidates; "backup"
        // is still unhealthy too so nothing is active yet.
        assert!(mgr.select_candidates().is_empty());
        let groups = mgr.list_groups();
        let main = groups.iter().find(|g| g.name == "main").unwrap();
        assert_eq!(main.state, GroupState::InCooldown);
    }

    #[test]
    fn force_activate_ignores_zero_healthy_precondition() {
        let cfg = config_with_two_groups();
        let mgr = EndpointManager::new(&cfg);
        assert!(mgr.force_activate_group("main").is_ok());
        let groups = mgr.list_groups();
        let main = groups.iter().find(|g| g.name == "main").unwrap();
        assert!(main.is_active());
        assert!(main.force_activated);
    }

    #[test]
    fn manual_pause_sets_manually_paused_and_blocks_auto_resume() {
        let mut cfg = config_with_two_groups();
        cfg.group.auto_switch_between_groups = false;
        let mgr = EndpointManager::new(&cfg);
        mgr.activate_group("main").unwrap_or(());
        // Without healthy endpoints activation fails; force it instead.
        mgr.force_activate_group("main").unwrap();
        mgr.pause_group("main").unwrap();
        let groups = mgr.list_groups();
        let main = groups.iter().find(|g| g.name == "main").unwrap();
        assert!(!main.is_active());
        assert!(main.manually_paused);
        assert!(!main.can_activate());
    }

    #[test]
    fn at_most_one_group_active_at_a_time() {
        let cfg = config_with_two_groups();
        let mgr = EndpointManager::new(&cfg);
        mgr.force_activate_group("main").unwrap();
        mgr.force_activate_group("backup").unwrap();
        let active_count = mgr.list_groups().iter().filter(|g| g.is_active()).count();
        assert_eq!(active_count, 1);
    }
}
