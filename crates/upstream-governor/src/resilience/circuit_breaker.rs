//! Per-endpoint circuit breaking for upstream resilience.
//!
//! Prevents the governor from hammering an endpoint that keeps failing. Once
//! an endpoint's circuit opens, requests fail fast (or are served from
//! cache) until the reset timeout has elapsed.
//!
//! # Circuit Breaker States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    CIRCUIT BREAKER STATE MACHINE                    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │      success: failures -= 1                 any failure             │
//! │            ┌──────┐                  ┌─────────────────────┐        │
//! │            │      ▼                  ▼                     │        │
//! │      ┌──────────┐          ┌──────────┐          ┌──────────┐       │
//! │      │  CLOSED  │ ───────► │   OPEN   │ ───────► │HALF-OPEN │       │
//! │      │ (normal) │ failures │ (reject) │ next     │  (probe) │       │
//! │      └──────────┘ >= thr.  └──────────┘ check    └──────────┘       │
//! │            ▲                            after timeout  │            │
//! │            │                                           │            │
//! │            └───────────────────────────────────────────┘            │
//! │                    successes >= success_threshold                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The OPEN → HALF-OPEN transition is lazy: it happens on the first check
//! after `next_attempt_at`, not on a timer. Every caller that observes
//! HALF-OPEN is let through, so several probes may run at once.

use crate::domain::config::CircuitBreakerConfig;
use crate::domain::Timestamp;
use crate::ports::TimeSource;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit is open - requests are rejected immediately
    Open,
    /// Testing if the endpoint is healthy - probes pass through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of one endpoint's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Timestamp>,
    pub next_attempt_at: Option<Timestamp>,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl CircuitBreakerState {
    fn closed(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            total_requests: 0,
            total_failures: 0,
        }
    }
}

/// Per-endpoint circuit state
#[derive(Debug)]
struct EndpointCircuit {
    state: CircuitState,
    failure_count: u32,
    /// Successes since entering half-open
    success_count: u32,
    last_failure_at: Option<Timestamp>,
    next_attempt_at: Option<Timestamp>,
    total_requests: u64,
    total_failures: u64,
}

impl EndpointCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn open(&mut self, now: Timestamp, reset_timeout: Duration) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.next_attempt_at = Some(now + reset_timeout.as_millis() as u64);
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.next_attempt_at = None;
    }

    fn snapshot(&self, endpoint: &str) -> CircuitBreakerState {
        CircuitBreakerState {
            endpoint: endpoint.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_at: self.last_failure_at,
            next_attempt_at: self.next_attempt_at,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
        }
    }
}

/// Circuit breaker manager for all endpoints
pub struct CircuitBreakerManager {
    /// Per-endpoint circuits
    circuits: RwLock<HashMap<String, EndpointCircuit>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn TimeSource>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Check if a request to the endpoint should be allowed.
    ///
    /// Returns `Err(remaining)` while the circuit is open. The first check
    /// after the reset timeout moves the circuit to half-open and passes.
    pub fn check(&self, endpoint: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = self.clock.now();
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(EndpointCircuit::new);

        circuit.total_requests += 1;

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let next_attempt_at = circuit.next_attempt_at.unwrap_or(now);
                if now >= next_attempt_at {
                    info!(
                        endpoint = endpoint,
                        "Circuit breaker transitioning to half-open"
                    );
                    circuit.state = CircuitState::HalfOpen;
                    circuit.success_count = 0;
                    Ok(())
                } else {
                    let remaining = next_attempt_at - now;
                    debug!(
                        endpoint = endpoint,
                        remaining_ms = remaining,
                        "Circuit breaker is open, rejecting request"
                    );
                    Err(Duration::from_millis(remaining))
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self, endpoint: &str) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(EndpointCircuit::new);

        match circuit.state {
            CircuitState::Closed => {
                // Recent successes heal gradually instead of resetting
                circuit.failure_count = circuit.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= self.config.success_threshold {
                    info!(
                        endpoint = endpoint,
                        successes = circuit.success_count,
                        "Circuit breaker closing after successful probes"
                    );
                    circuit.close();
                }
            }
            CircuitState::Open => {
                // Late completion of a request dispatched before the circuit opened
                debug!(endpoint = endpoint, "Ignoring success while circuit is open");
            }
        }
    }

    /// Record a failed request.
    ///
    /// Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self, endpoint: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let now = self.clock.now();
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(endpoint.to_string())
            .or_insert_with(EndpointCircuit::new);

        circuit.total_failures += 1;
        circuit.last_failure_at = Some(now);

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.config.failure_threshold {
                    warn!(
                        endpoint = endpoint,
                        failures = circuit.failure_count,
                        threshold = self.config.failure_threshold,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit breaker opening due to failures"
                    );
                    circuit.open(now, self.config.reset_timeout);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    endpoint = endpoint,
                    "Circuit breaker reopening after probe failure"
                );
                circuit.open(now, self.config.reset_timeout);
                true
            }
            CircuitState::Open => {
                // Already open - extend the timeout
                circuit.next_attempt_at = Some(now + self.config.reset_timeout.as_millis() as u64);
                false
            }
        }
    }

    /// Get the current state of an endpoint's circuit breaker
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits
            .read()
            .get(endpoint)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Full breaker state for `endpoint` (closed defaults if never seen)
    pub fn status(&self, endpoint: &str) -> CircuitBreakerState {
        self.circuits
            .read()
            .get(endpoint)
            .map(|c| c.snapshot(endpoint))
            .unwrap_or_else(|| CircuitBreakerState::closed(endpoint))
    }

    /// States of every known endpoint, sorted by endpoint
    pub fn stats(&self) -> Vec<CircuitBreakerState> {
        let mut stats: Vec<_> = self
            .circuits
            .read()
            .iter()
            .map(|(endpoint, circuit)| circuit.snapshot(endpoint))
            .collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    /// Reset a specific circuit (for admin purposes)
    pub fn reset(&self, endpoint: &str) {
        let mut circuits = self.circuits.write();
        if let Some(circuit) = circuits.get_mut(endpoint) {
            info!(endpoint = endpoint, "Circuit breaker manually reset");
            circuit.close();
        }
    }

    /// Forget every circuit
    pub fn reset_all(&self) {
        let mut circuits = self.circuits.write();
        if !circuits.is_empty() {
            info!(count = circuits.len(), "All circuit breakers reset");
        }
        circuits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualTimeSource;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(100),
        }
    }

    fn manager() -> (CircuitBreakerManager, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::new(1_000));
        (CircuitBreakerManager::new(test_config(), clock.clone()), clock)
    }

    fn open_circuit(manager: &CircuitBreakerManager, endpoint: &str) {
        for _ in 0..3 {
            manager.check(endpoint).unwrap();
            manager.record_failure(endpoint);
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let (manager, _) = manager();
        assert_eq!(manager.state("test-endpoint"), CircuitState::Closed);
        assert!(manager.check("test-endpoint").is_ok());
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let (manager, _) = manager();

        for i in 0..3 {
            manager.check("test-endpoint").unwrap();
            let opened = manager.record_failure("test-endpoint");

            if i < 2 {
                assert!(!opened);
                assert_eq!(manager.state("test-endpoint"), CircuitState::Closed);
            } else {
                assert!(opened);
            }
        }

        assert_eq!(manager.state("test-endpoint"), CircuitState::Open);
        let status = manager.status("test-endpoint");
        assert_eq!(status.next_attempt_at, Some(1_100));
        assert_eq!(status.last_failure_at, Some(1_000));
    }

    #[test]
    fn test_circuit_rejects_when_open() {
        let (manager, clock) = manager();
        open_circuit(&manager, "test-endpoint");

        clock.advance(Duration::from_millis(40));
        let remaining = manager.check("test-endpoint").unwrap_err();
        assert_eq!(remaining, Duration::from_millis(60));
        assert_eq!(manager.state("test-endpoint"), CircuitState::Open);
    }

    #[test]
    fn test_circuit_transitions_to_half_open_on_next_check() {
        let (manager, clock) = manager();
        open_circuit(&manager, "test-endpoint");

        clock.advance(Duration::from_millis(150));
        // No timer: still open until someone checks
        assert_eq!(manager.state("test-endpoint"), CircuitState::Open);

        assert!(manager.check("test-endpoint").is_ok());
        assert_eq!(manager.state("test-endpoint"), CircuitState::HalfOpen);
        // Concurrent probes are let through
        assert!(manager.check("test-endpoint").is_ok());
    }

    #[test]
    fn test_circuit_closes_after_successes_in_half_open() {
        let (manager, clock) = manager();
        open_circuit(&manager, "test-endpoint");

        clock.advance(Duration::from_millis(150));
        manager.check("test-endpoint").unwrap();

        manager.record_success("test-endpoint");
        assert_eq!(manager.state("test-endpoint"), CircuitState::HalfOpen);

        manager.record_success("test-endpoint");
        assert_eq!(manager.state("test-endpoint"), CircuitState::Closed);
        assert_eq!(manager.status("test-endpoint").failure_count, 0);
    }

    #[test]
    fn test_circuit_reopens_on_failure_in_half_open() {
        let (manager, clock) = manager();
        open_circuit(&manager, "test-endpoint");

        clock.advance(Duration::from_millis(150));
        manager.check("test-endpoint").unwrap();
        manager.record_success("test-endpoint");
        assert_eq!(manager.state("test-endpoint"), CircuitState::HalfOpen);

        // One failure is enough in half-open
        assert!(manager.record_failure("test-endpoint"));
        assert_eq!(manager.state("test-endpoint"), CircuitState::Open);
        assert_eq!(manager.status("test-endpoint").success_count, 0);
    }

    #[test]
    fn test_success_decrements_failure_count() {
        let (manager, _) = manager();

        manager.record_failure("test-endpoint");
        manager.record_failure("test-endpoint");
        manager.record_success("test-endpoint");
        assert_eq!(manager.status("test-endpoint").failure_count, 1);

        // 1 + 1 = 2 < 3
        manager.record_failure("test-endpoint");
        assert_eq!(manager.state("test-endpoint"), CircuitState::Closed);

        // 2 + 1 = 3 opens
        manager.record_failure("test-endpoint");
        assert_eq!(manager.state("test-endpoint"), CircuitState::Open);
    }

    #[test]
    fn test_failure_count_floor_is_zero() {
        let (manager, _) = manager();
        manager.record_success("test-endpoint");
        manager.record_success("test-endpoint");
        assert_eq!(manager.status("test-endpoint").failure_count, 0);
    }

    #[test]
    fn test_failure_while_open_extends_timeout() {
        let (manager, clock) = manager();
        open_circuit(&manager, "test-endpoint");

        clock.advance(Duration::from_millis(50));
        assert!(!manager.record_failure("test-endpoint"));
        assert_eq!(manager.status("test-endpoint").next_attempt_at, Some(1_150));
    }

    #[test]
    fn test_reset_circuit() {
        let (manager, _) = manager();
        open_circuit(&manager, "test-endpoint");

        manager.reset("test-endpoint");
        assert_eq!(manager.state("test-endpoint"), CircuitState::Closed);
        assert!(manager.check("test-endpoint").is_ok());
    }

    #[test]
    fn test_reset_all_forgets_circuits() {
        let (manager, _) = manager();
        open_circuit(&manager, "a");
        manager.record_failure("b");

        manager.reset_all();
        assert!(manager.stats().is_empty());
        assert_eq!(manager.state("a"), CircuitState::Closed);
    }

    #[test]
    fn test_disabled_circuit_breaker() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let mut config = test_config();
        config.enabled = false;
        let manager = CircuitBreakerManager::new(config, clock);

        for _ in 0..10 {
            manager.check("test-endpoint").unwrap();
            manager.record_failure("test-endpoint");
        }

        assert!(manager.check("test-endpoint").is_ok());
    }

    #[test]
    fn test_get_stats() {
        let (manager, _) = manager();

        manager.check("endpoint-b").unwrap();
        manager.record_failure("endpoint-b");
        manager.check("endpoint-a").unwrap();
        manager.record_success("endpoint-a");

        let stats = manager.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].endpoint, "endpoint-a");
        assert_eq!(stats[1].total_failures, 1);
        assert_eq!(stats[1].total_requests, 1);
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }
}
