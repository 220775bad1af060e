//! Shared, TTL-bound per-provider health state.
//!
//! One entry per provider in a concurrent map, with the cooldown chosen
//! by outcome class rather than a consecutive-failure counter: a single
//! rate-limit, server, auth, or transport outcome opens the circuit
//! immediately.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Outcome;
use crate::registry::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-outcome-class cooldowns, overriding the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitCooldowns {
    #[serde(with = "crate::common::duration_serde")]
    pub rate_limit: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub server_error: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub auth_error: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub transport_error: Duration,
}

impl Default for CircuitCooldowns {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_secs(60),
            server_error: Duration::from_secs(30),
            auth_error: Duration::from_secs(3600),
            transport_error: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct HealthEntry {
    state: CircuitState,
    successes: u64,
    failures: u64,
    opened_at: Option<Instant>,
    cooldown: Duration,
    half_open_probe_in_flight: bool,
}

impl Default for HealthEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            successes: 0,
            failures: 0,
            opened_at: None,
            cooldown: Duration::ZERO,
            half_open_probe_in_flight: false,
        }
    }
}

/// Snapshot returned by `CheckHealth`. Absence of an entry means
/// "closed, no history" (`success_rate` defaults to 1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthRecord {
    pub circuit: CircuitState,
    pub success_rate: f64,
}

pub struct HealthStore {
    entries: DashMap<ProviderId, HealthEntry>,
    cooldowns: CircuitCooldowns,
}

impl HealthStore {
    pub fn new(cooldowns: CircuitCooldowns) -> Self {
        Self {
            entries: DashMap::new(),
            cooldowns,
        }
    }

    /// `CheckHealth(provider-id) -> HealthRecord`. Lazily transitions
    /// `open -> half-open` once the cooldown has elapsed.
    pub fn check_health(&self, provider: &ProviderId) -> HealthRecord {
        let Some(mut entry) = self.entries.get_mut(provider) else {
            return HealthRecord {
                circuit: CircuitState::Closed,
                success_rate: 1.0,
            };
        };

        if entry.state == CircuitState::Open {
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed() >= entry.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_probe_in_flight = false;
                    tracing::info!(provider = %provider, "circuit transitioning to half-open");
                }
            }
        }

        HealthRecord {
            circuit: entry.state,
            success_rate: success_rate(entry.successes, entry.failures),
        }
    }

    /// `RecordOutcome(provider-id, outcome)`.
    pub fn record_outcome(&self, provider: &ProviderId, outcome: Outcome) {
        let mut entry = self.entries.entry(provider.clone()).or_default();

        match outcome {
            Outcome::Success => {
                entry.successes += 1;
                match entry.state {
                    CircuitState::HalfOpen => {
                        entry.state = CircuitState::Closed;
                        entry.opened_at = None;
                        entry.half_open_probe_in_flight = false;
                        tracing::info!(provider = %provider, "circuit closed after successful probe");
                    }
                    CircuitState::Closed => {}
                    CircuitState::Open => {
                        // A success landing while still open means the
                        // half-open probe raced the cooldown check; close
                        // anyway, last-writer-wins on the circuit field.
                        entry.state = CircuitState::Closed;
                        entry.opened_at = None;
                    }
                }
            }
            Outcome::ClientError => {
                entry.failures += 1;
                // non-429 4xx: no circuit effect, per the outcome table.
            }
            Outcome::Cancelled => {
                // no health penalty for caller cancellation.
            }
            Outcome::RateLimit | Outcome::ServerError | Outcome::AuthError | Outcome::TransportError => {
                entry.failures += 1;
                let cooldown = match outcome {
                    Outcome::RateLimit => self.cooldowns.rate_limit,
                    Outcome::ServerError => self.cooldowns.server_error,
                    Outcome::AuthError => self.cooldowns.auth_error,
                    Outcome::TransportError => self.cooldowns.transport_error,
                    _ => unreachable!(),
                };
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.cooldown = cooldown;
                entry.half_open_probe_in_flight = false;
                tracing::warn!(provider = %provider, ?outcome, cooldown = ?cooldown, "circuit opened");
            }
        }
    }
}

fn success_rate(successes: u64, failures: u64) -> f64 {
    let total = successes + failures;
    if total == 0 {
        1.0
    } else {
        successes as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderId {
        ProviderId::from(id)
    }

    #[test]
    fn missing_provider_is_closed_with_full_success_rate() {
        let store = HealthStore::new(CircuitCooldowns::default());
        let record = store.check_health(&provider("free-a"));
        assert_eq!(record.circuit, CircuitState::Closed);
        assert_eq!(record.success_rate, 1.0);
    }

    #[test]
    fn single_rate_limit_opens_circuit_immediately() {
        let store = HealthStore::new(CircuitCooldowns::default());
        store.record_outcome(&provider("free-a"), Outcome::RateLimit);
        assert_eq!(store.check_health(&provider("free-a")).circuit, CircuitState::Open);
    }

    #[test]
    fn client_error_does_not_open_circuit() {
        let store = HealthStore::new(CircuitCooldowns::default());
        store.record_outcome(&provider("free-a"), Outcome::ClientError);
        assert_eq!(store.check_health(&provider("free-a")).circuit, CircuitState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_cooldown() {
        let mut cooldowns = CircuitCooldowns::default();
        cooldowns.server_error = Duration::from_millis(10);
        let store = HealthStore::new(cooldowns);
        store.record_outcome(&provider("p"), Outcome::ServerError);
        assert_eq!(store.check_health(&provider("p")).circuit, CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.check_health(&provider("p")).circuit, CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_on_success_and_reopens_on_failure() {
        let mut cooldowns = CircuitCooldowns::default();
        cooldowns.server_error = Duration::from_millis(5);
        let store = HealthStore::new(cooldowns);
        store.record_outcome(&provider("p"), Outcome::ServerError);
        std::thread::sleep(Duration::from_millis(10));
        store.check_health(&provider("p")); // triggers half-open transition
        store.record_outcome(&provider("p"), Outcome::Success);
        assert_eq!(store.check_health(&provider("p")).circuit, CircuitState::Closed);
    }

    #[test]
    fn cancellation_records_no_penalty() {
        let store = HealthStore::new(CircuitCooldowns::default());
        store.record_outcome(&provider("p"), Outcome::Cancelled);
        assert_eq!(store.check_health(&provider("p")).circuit, CircuitState::Closed);
    }
}
