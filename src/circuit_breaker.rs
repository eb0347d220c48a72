//! Pure circuit-breaker state machine (C4). No I/O: callers own the clock
//! and the failure log; this module only decides transitions. Used directly
//! by the hot-state manager (§4.3.2) and, keyed per remote host over the
//! shared KV engine, by the resilient HTTP client (§4.5).

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// 0=closed, 1=half-open, 2=open, matching the
    /// `dragonfly_circuit_breaker_state` gauge convention (spec §6).
    pub fn as_gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` before the circuit opens.
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    /// How long the circuit stays open before allowing a half-open probe.
    pub reset_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, failure_window_secs: 60, reset_secs: 300 }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_secs(self.reset_secs)
    }
}

/// Snapshot of circuit state carried by callers (in memory, or round-tripped
/// through the KV engine for a cross-replica breaker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Circuit {
    pub state: CircuitState,
    /// Unix-millis timestamps of recent failures, pruned on every mutation.
    pub failures: Vec<i64>,
    pub opened_at: Option<i64>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self { state: CircuitState::Closed, failures: Vec::new(), opened_at: None }
    }
}

pub struct CheckResult {
    pub can_proceed: bool,
    pub circuit: Circuit,
}

impl Circuit {
    fn prune(&mut self, now_ms: i64, window: &CircuitBreakerConfig) {
        let cutoff = now_ms - window.failure_window().as_millis() as i64;
        self.failures.retain(|t| *t >= cutoff);
    }

    /// `open` -> `half-open` once `reset_secs` has elapsed since `opened_at`.
    /// Does not otherwise mutate state; callers must call `record_success`/
    /// `record_failure` to act on the probe outcome.
    pub fn check(mut self, cfg: &CircuitBreakerConfig, now_ms: i64) -> CheckResult {
        match self.state {
            CircuitState::Closed => CheckResult { can_proceed: true, circuit: self },
            CircuitState::HalfOpen => CheckResult { can_proceed: true, circuit: self },
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now_ms);
                if now_ms - opened_at >= cfg.reset_after().as_millis() as i64 {
                    self.state = CircuitState::HalfOpen;
                    CheckResult { can_proceed: true, circuit: self }
                } else {
                    CheckResult { can_proceed: false, circuit: self }
                }
            }
        }
    }

    pub fn record_success(mut self) -> Self {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failures.clear();
                self.opened_at = None;
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
        self
    }

    pub fn record_failure(mut self, cfg: &CircuitBreakerConfig, now_ms: i64) -> Self {
        self.prune(now_ms, cfg);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now_ms);
            }
            CircuitState::Closed => {
                self.failures.push(now_ms);
                if self.failures.len() as u32 >= cfg.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now_ms);
                }
            }
            CircuitState::Open => {
                self.opened_at = Some(now_ms);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold: 3, failure_window_secs: 60, reset_secs: 30 }
    }

    #[test]
    fn opens_after_threshold_failures_in_window() {
        let cfg = cfg();
        let mut c = Circuit::default();
        for t in [0, 1_000, 2_000] {
            c = c.record_failure(&cfg, t);
        }
        assert_eq!(c.state, CircuitState::Open);
    }

    #[test]
    fn stays_closed_when_failures_fall_outside_window() {
        let cfg = cfg();
        let mut c = Circuit::default();
        c = c.record_failure(&cfg, 0);
        c = c.record_failure(&cfg, 1_000);
        // third failure arrives after the window has rolled past the first two
        c = c.record_failure(&cfg, 70_000);
        assert_eq!(c.state, CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_then_close_on_success() {
        let cfg = cfg();
        let mut c = Circuit::default();
        for t in [0, 1_000, 2_000] {
            c = c.record_failure(&cfg, t);
        }
        assert_eq!(c.state, CircuitState::Open);

        let blocked = c.clone().check(&cfg, 10_000);
        assert!(!blocked.can_proceed);

        let probe = c.check(&cfg, 40_000);
        assert!(probe.can_proceed);
        c = probe.circuit;
        assert_eq!(c.state, CircuitState::HalfOpen);

        c = c.record_success();
        assert_eq!(c.state, CircuitState::Closed);
        assert!(c.failures.is_empty());
    }

    #[test]
    fn half_open_failure_reopens() {
        let cfg = cfg();
        let mut c = Circuit { state: CircuitState::HalfOpen, failures: vec![], opened_at: Some(0) };
        c = c.record_failure(&cfg, 100);
        assert_eq!(c.state, CircuitState::Open);
        assert_eq!(c.opened_at, Some(100));
    }
}
