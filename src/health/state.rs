//! Backend health state machine.
//!
//! # States
//! - Up: backend receives traffic
//! - Down: backend excluded from selection
//!
//! # State Transitions
//! ```text
//! Up → Down: consecutive failures >= unhealthy_threshold
//! Down → Up: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on state transition
//! - The counters themselves live on `Backend` as atomics; this module only
//!   holds the thresholds and the transition vocabulary

use crate::config::HealthCheckConfig;

/// Debounce thresholds for health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    unhealthy: u32,
    healthy: u32,
}

impl Thresholds {
    /// Thresholds below one are clamped to one.
    pub fn new(unhealthy: u32, healthy: u32) -> Self {
        Self {
            unhealthy: unhealthy.max(1),
            healthy: healthy.max(1),
        }
    }

    pub fn unhealthy(&self) -> u32 {
        self.unhealthy
    }

    pub fn healthy(&self) -> u32 {
        self.healthy
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(3, 1)
    }
}

impl From<&HealthCheckConfig> for Thresholds {
    fn from(config: &HealthCheckConfig) -> Self {
        Self::new(config.unhealthy_threshold, config.healthy_threshold)
    }
}

/// A committed health transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentDown,
    WentUp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_thresholds_clamp_to_one() {
        let t = Thresholds::new(0, 0);
        assert_eq!(t.unhealthy(), 1);
        assert_eq!(t.healthy(), 1);
    }

    #[test]
    fn defaults_match_config_defaults() {
        assert_eq!(
            Thresholds::from(&HealthCheckConfig::default()),
            Thresholds::default()
        );
    }
}
