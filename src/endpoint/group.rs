//! Group state machine: active, manually paused, or in cooldown.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Active,
    Paused,
    InCooldown,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub priority: u32,
    pub state: GroupState,
    pub manually_paused: bool,
    pub force_activated: bool,
    pub cooldown_until: Option<Instant>,
    pub healthy_count: usize,
    pub total_count: usize,
}

impl Group {
    pub fn new(name: String, priority: u32) -> Self {
        Self {
            name,
            priority,
            state: GroupState::Paused,
            manually_paused: false,
            force_activated: false,
            cooldown_until: None,
            healthy_count: 0,
            total_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == GroupState::Active
    }

    /// `canActivate = healthyCount>0 ∧ ¬active ∧ ¬inCooldown`.
    pub fn can_activate(&self) -> bool {
        self.healthy_count > 0 && self.state == GroupState::Paused
    }

    /// `canPause = ¬manuallyPaused`.
    pub fn can_pause(&self) -> bool {
        !self.manually_paused
    }

    /// `canResume = manuallyPaused`.
    pub fn can_resume(&self) -> bool {
        self.manually_paused
    }

    /// `canForceActivate = healthyCount==0 ∧ ¬active ∧ ¬inCooldown`.
    pub fn can_force_activate(&self) -> bool {
        self.healthy_count == 0 && self.state == GroupState::Paused
    }

    /// Whether the cooldown window has elapsed (`now ≥ cooldownUntil`).
    pub fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_booleans_match_state_transition_rules() {
        let mut g = Group::new("main".to_string(), 0);
        g.healthy_count = 2;
        assert!(g.can_activate());
        assert!(g.can_pause());
        assert!(!g.can_resume());
        assert!(!g.can_force_activate());

        g.state = GroupState::Active;
        assert!(!g.can_activate());

        g.state = GroupState::Paused;
        g.manually_paused = true;
        assert!(!g.can_pause());
        assert!(g.can_resume());

        g.manually_paused = false;
        g.healthy_count = 0;
        assert!(g.can_force_activate());
        assert!(!g.can_activate());
    }
}
