//! The Smart Router: produces a totally ordered candidate list for one
//! request.
//!
//! A full resolve → tenant-gate → filter → score → order pipeline,
//! consuming [`crate::registry::Registry`], [`crate::health::HealthStore`],
//! and [`crate::quota::QuotaStore`] directly rather than a single flat
//! stats map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::health::{CircuitState, HealthStore};
use crate::quota::QuotaStore;
use crate::registry::{Candidate, ProviderId, Registry};

/// `{w_tier, w_health, w_latency, w_cost}`, configured per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterWeights {
    pub w_tier: f64,
    pub w_health: f64,
    pub w_latency: f64,
    pub w_cost: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            w_tier: 0.4,
            w_health: 0.3,
            w_latency: 0.2,
            w_cost: 0.1,
        }
    }
}

#[derive(Clone)]
pub struct Router {
    registry: Registry,
    health: Arc<HealthStore>,
    quota: Arc<QuotaStore>,
    weights: RouterWeights,
    quota_window: Duration,
    /// `providers[…].is-free` overrides: providers in this set are
    /// treated as free tier for every model they serve, regardless of
    /// the `GlobalModel`'s stored price.
    force_free: Arc<HashMap<ProviderId, bool>>,
}

impl Router {
    pub fn new(
        registry: Registry,
        health: impl Into<Arc<HealthStore>>,
        quota: impl Into<Arc<QuotaStore>>,
        weights: RouterWeights,
        quota_window: Duration,
    ) -> Self {
        Self::with_force_free(registry, health, quota, weights, quota_window, HashMap::new())
    }

    pub fn with_force_free(
        registry: Registry,
        health: impl Into<Arc<HealthStore>>,
        quota: impl Into<Arc<QuotaStore>>,
        weights: RouterWeights,
        quota_window: Duration,
        force_free: HashMap<ProviderId, bool>,
    ) -> Self {
        Self {
            registry,
            health: health.into(),
            quota: quota.into(),
            weights,
            quota_window,
            force_free: Arc::new(force_free),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthStore> {
        &self.health
    }

    pub fn quota(&self) -> &Arc<QuotaStore> {
        &self.quota
    }

    /// `GetCandidates(requested-model, tenant-id?, preferred-provider?) -> list<Candidate>`,
    /// implementing the resolve → tenant-gate → filter → score → order
    /// algorithm described above.
    pub async fn get_candidates(
        &self,
        requested_model: &str,
        tenant_id: Option<&str>,
        preferred_provider: Option<&str>,
    ) -> Result<Vec<Candidate>, CoreError> {
        // 1. Resolve.
        let resolutions = self.registry.resolve(requested_model).await?;

        // 2. Tenant gate. Any resolved global model id can trip the gate;
        // check each in turn (an alias spanning several canonical ids
        // each carries its own budget row).
        if let Some(tenant_id) = tenant_id {
            for resolution in &resolutions {
                if let Some(budget) = self
                    .registry
                    .tenant_budget(tenant_id, &resolution.global_model.id)
                    .await
                {
                    if budget.is_exhausted() {
                        return Err(CoreError::BudgetExceeded {
                            tenant: tenant_id.to_string(),
                            model: resolution.global_model.id.clone(),
                        });
                    }
                }
            }
        }

        // 3. Filter + 4. Score.
        let mut candidates = Vec::new();
        for resolution in &resolutions {
            let global_is_free = resolution.global_model.is_free();
            let alias_position = resolution.alias_position.unwrap_or(0);

            for provider_model in &resolution.provider_models {
                if !provider_model.available {
                    continue;
                }
                let is_free = global_is_free
                    || self.force_free.get(&provider_model.provider_id).copied().unwrap_or(false);
                if self.health.check_health(&provider_model.provider_id).circuit == CircuitState::Open {
                    continue;
                }
                let quota = self
                    .quota
                    .peek(&provider_model.provider_id, self.quota_window, provider_model.rate_limit_rpm);
                if !quota.allowed {
                    continue;
                }

                let health_record = self.health.check_health(&provider_model.provider_id);
                let normalized_latency = provider_model
                    .p95_latency_ms
                    .map(|ms| (ms as f64 / 10_000.0).min(1.0))
                    .unwrap_or(0.5);
                let cost_factor = if is_free { 0.0 } else { 1.0 };
                let tier = tier_score(is_free, alias_position);

                let score = self.weights.w_tier * tier
                    + self.weights.w_health * health_record.success_rate
                    + self.weights.w_latency * (1.0 - normalized_latency)
                    + self.weights.w_cost * (1.0 - cost_factor);

                candidates.push(ScoredCandidate {
                    candidate: Candidate {
                        provider_id: provider_model.provider_id.clone(),
                        provider_model_id: provider_model.provider_model_id.clone(),
                        global_model_id: resolution.global_model.id.clone(),
                        is_free,
                        health_score: health_record.success_rate,
                        estimated_latency_ms: provider_model.p95_latency_ms.unwrap_or(0),
                        rate_limit_rpm: provider_model.rate_limit_rpm,
                        alias_position,
                    },
                    score,
                });
            }
        }

        // 5. Order, by (preferred-provider match desc, is-free desc,
        // alias-position asc, score desc, provider-id asc).
        candidates.sort_by(|a, b| {
            let a_preferred = preferred_provider.map(|p| a.candidate.provider_id.0 == p).unwrap_or(false);
            let b_preferred = preferred_provider.map(|p| b.candidate.provider_id.0 == p).unwrap_or(false);

            b_preferred
                .cmp(&a_preferred)
                .then(b.candidate.is_free.cmp(&a.candidate.is_free))
                .then(a.candidate.alias_position.cmp(&b.candidate.alias_position))
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.candidate.provider_id.cmp(&b.candidate.provider_id))
        });

        // 6. Return.
        Ok(candidates.into_iter().map(|sc| sc.candidate).collect())
    }
}

struct ScoredCandidate {
    candidate: Candidate,
    score: f64,
}

fn tier_score(is_free: bool, alias_position: u32) -> f64 {
    let base = if is_free { 1.0 } else { 0.5 };
    base - (alias_position as f64 * 0.01)
}
