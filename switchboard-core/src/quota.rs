//! Per-`(provider, window)` atomic request counters.
//!
//! Keyed by provider plus window size rather than by caller, with a
//! peek-only variant so the Router can filter without mutating state —
//! the real increment happens only once, in the Orchestrator.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::registry::ProviderId;

#[derive(Clone, Debug)]
struct QuotaCounter {
    count: u32,
    window_start: Instant,
}

impl QuotaCounter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn is_expired(&self, window: Duration) -> bool {
        self.window_start.elapsed() >= window
    }

    fn reset(&mut self) {
        self.count = 0;
        self.window_start = Instant::now();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub remaining: u32,
}

pub struct QuotaStore {
    counters: DashMap<(ProviderId, Duration), QuotaCounter>,
}

impl Default for QuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Peek at whether one more request would be allowed, without
    /// incrementing. Used by the Router's filter step. `limit = None`
    /// means unlimited.
    pub fn peek(&self, provider: &ProviderId, window: Duration, limit: Option<u32>) -> QuotaCheck {
        let Some(limit) = limit else {
            return QuotaCheck {
                allowed: true,
                remaining: u32::MAX,
            };
        };
        match self.counters.get(&(provider.clone(), window)) {
            Some(counter) if !counter.is_expired(window) => QuotaCheck {
                allowed: counter.count < limit,
                remaining: limit.saturating_sub(counter.count),
            },
            _ => QuotaCheck {
                allowed: limit > 0,
                remaining: limit,
            },
        }
    }

    /// `CheckQuota(provider-id, window) -> {allowed, remaining}`: atomic
    /// compare-and-increment. Does not increment when it would exceed
    /// the limit. `limit = None` means unlimited (always allowed, never
    /// incremented — there is nothing to bound).
    pub fn check_and_increment(
        &self,
        provider: &ProviderId,
        window: Duration,
        limit: Option<u32>,
    ) -> QuotaCheck {
        let Some(limit) = limit else {
            return QuotaCheck {
                allowed: true,
                remaining: u32::MAX,
            };
        };

        let mut counter = self
            .counters
            .entry((provider.clone(), window))
            .or_insert_with(QuotaCounter::new);

        if counter.is_expired(window) {
            counter.reset();
        }

        if counter.count >= limit {
            return QuotaCheck {
                allowed: false,
                remaining: 0,
            };
        }

        counter.count += 1;
        QuotaCheck {
            allowed: true,
            remaining: limit - counter.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderId {
        ProviderId::from(id)
    }

    #[test]
    fn unlimited_quota_always_allowed() {
        let store = QuotaStore::new();
        let check = store.check_and_increment(&provider("p"), Duration::from_secs(60), None);
        assert!(check.allowed);
    }

    #[test]
    fn increments_exhaust_limit() {
        let store = QuotaStore::new();
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            assert!(store.check_and_increment(&provider("p"), window, Some(3)).allowed);
        }
        assert!(!store.check_and_increment(&provider("p"), window, Some(3)).allowed);
    }

    #[test]
    fn window_expiry_resets_counter() {
        let store = QuotaStore::new();
        let window = Duration::from_millis(10);
        assert!(store.check_and_increment(&provider("p"), window, Some(1)).allowed);
        assert!(!store.check_and_increment(&provider("p"), window, Some(1)).allowed);
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.check_and_increment(&provider("p"), window, Some(1)).allowed);
    }

    #[test]
    fn peek_does_not_mutate() {
        let store = QuotaStore::new();
        let window = Duration::from_secs(60);
        let _ = store.peek(&provider("p"), window, Some(1));
        let _ = store.peek(&provider("p"), window, Some(1));
        assert!(store.check_and_increment(&provider("p"), window, Some(1)).allowed);
    }

    #[test]
    fn concurrent_checks_allow_exactly_the_limit() {
        use std::sync::Arc;
        let store = Arc::new(QuotaStore::new());
        let window = Duration::from_secs(60);
        let limit = 10u32;
        let n = 25usize;
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .check_and_increment(&provider("p"), window, Some(limit))
                        .allowed
                })
            })
            .collect();
        let allowed_count = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&allowed| allowed)
            .count();
        assert_eq!(allowed_count, limit as usize);
    }
}
