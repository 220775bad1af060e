//! The Dynamic Model Registry's data model and read-side queries.
//!
//! Models and their per-provider availability live in a persistent
//! catalog rather than a hardcoded per-adapter list. The pluggability
//! shape (one trait, swappable concrete store) follows the same
//! trait-plus-in-memory-impl pattern used for caching elsewhere in this
//! crate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CoreError;

/// A provider id, e.g. `"openai"`, `"groq"`, `"cloudflare"`. Cheap to
/// clone and ordered lexicographically for the router's deterministic
/// tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderId(pub String);

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        ProviderId(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        ProviderId(s)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability flags carried on a [`GlobalModel`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: bool,
    pub vision: bool,
    pub streaming: bool,
}

/// Canonical, vendor-neutral model entry. Written only by CatalogSync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    pub id: String,
    pub display_name: String,
    pub context_window: u32,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub capabilities: Capabilities,
    pub last_sync: SystemTime,
}

impl GlobalModel {
    /// A model is free-tier when its input price is zero.
    pub fn is_free(&self) -> bool {
        self.input_price_per_million == 0.0
    }
}

/// Availability record: which provider serves which canonical model, at
/// what provider-specific id. Written only by ProviderDiscovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModel {
    pub provider_id: ProviderId,
    pub provider_model_id: String,
    pub global_model_id: String,
    pub available: bool,
    pub last_seen: SystemTime,
    pub rate_limit_rpm: Option<u32>,
    pub successes: u64,
    pub failures: u64,
    pub p95_latency_ms: Option<u32>,
}

impl ProviderModel {
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    /// Forces `available` false if `last_seen` exceeds the staleness
    /// horizon, even if the stored flag says otherwise.
    fn is_usable(&self, staleness_horizon: Duration) -> bool {
        self.available
            && self
                .last_seen
                .elapsed()
                .map(|age| age <= staleness_horizon)
                .unwrap_or(true)
    }
}

/// Per-(tenant, model) budget guardrail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantBudget {
    pub tenant_id: String,
    pub global_model_id: String,
    pub allowed_rpm: Option<u32>,
    pub monthly_budget: f64,
    pub current_month_spend: f64,
}

impl TenantBudget {
    pub fn is_exhausted(&self) -> bool {
        self.current_month_spend >= self.monthly_budget
    }
}

/// Transient router output. Never persisted; lives only for the
/// duration of one request's attempt chain.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: ProviderId,
    pub provider_model_id: String,
    pub global_model_id: String,
    pub is_free: bool,
    pub health_score: f64,
    pub estimated_latency_ms: u32,
    pub rate_limit_rpm: Option<u32>,
    /// Position in an alias's ordered list, if the request resolved
    /// through a semantic alias; `0` otherwise.
    pub alias_position: u32,
}

/// Pluggable backing store for the registry's reads and writes. The
/// core ships [`InMemoryRegistryStore`]; a real deployment swaps in any
/// transactional store with secondary indexes on provider id and
/// global model id.
#[async_trait::async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get_global_model(&self, id: &str) -> Option<GlobalModel>;
    async fn list_provider_models(&self, global_model_id: &str) -> Vec<ProviderModel>;
    async fn get_tenant_budget(&self, tenant_id: &str, global_model_id: &str) -> Option<TenantBudget>;

    async fn upsert_global_model(&self, model: GlobalModel);
    async fn upsert_provider_model(&self, model: ProviderModel);
    async fn upsert_tenant_budget(&self, budget: TenantBudget);
    /// Marks every `ProviderModel` for `provider_id` not present in
    /// `seen_provider_model_ids` as unavailable (ProviderDiscovery's
    /// sweep-completion step).
    async fn mark_unseen_unavailable(&self, provider_id: &ProviderId, seen_provider_model_ids: &[String]);
    async fn record_spend(&self, tenant_id: &str, global_model_id: &str, amount: f64);

    /// Returns a snapshot of every known canonical model.
    async fn list_all_global_models(&self) -> Vec<GlobalModel>;
}

#[derive(Default)]
struct InMemoryState {
    global_models: HashMap<String, GlobalModel>,
    provider_models: HashMap<(ProviderId, String), ProviderModel>,
    budgets: HashMap<(String, String), TenantBudget>,
}

/// In-memory `RegistryStore`, sufficient for tests and single-process
/// deployment: three related maps behind one `RwLock`, since reads
/// vastly outnumber writes.
#[derive(Default)]
pub struct InMemoryRegistryStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn get_global_model(&self, id: &str) -> Option<GlobalModel> {
        self.state.read().await.global_models.get(id).cloned()
    }

    async fn list_provider_models(&self, global_model_id: &str) -> Vec<ProviderModel> {
        self.state
            .read()
            .await
            .provider_models
            .values()
            .filter(|pm| pm.global_model_id == global_model_id)
            .cloned()
            .collect()
    }

    async fn get_tenant_budget(&self, tenant_id: &str, global_model_id: &str) -> Option<TenantBudget> {
        self.state
            .read()
            .await
            .budgets
            .get(&(tenant_id.to_string(), global_model_id.to_string()))
            .cloned()
    }

    async fn upsert_global_model(&self, model: GlobalModel) {
        self.state.write().await.global_models.insert(model.id.clone(), model);
    }

    async fn upsert_provider_model(&self, model: ProviderModel) {
        let key = (model.provider_id.clone(), model.provider_model_id.clone());
        self.state.write().await.provider_models.insert(key, model);
    }

    async fn upsert_tenant_budget(&self, budget: TenantBudget) {
        let key = (budget.tenant_id.clone(), budget.global_model_id.clone());
        self.state.write().await.budgets.insert(key, budget);
    }

    async fn mark_unseen_unavailable(&self, provider_id: &ProviderId, seen_provider_model_ids: &[String]) {
        let mut state = self.state.write().await;
        for pm in state.provider_models.values_mut() {
            if &pm.provider_id == provider_id && !seen_provider_model_ids.contains(&pm.provider_model_id) {
                pm.available = false;
            }
        }
    }

    async fn record_spend(&self, tenant_id: &str, global_model_id: &str, amount: f64) {
        let mut state = self.state.write().await;
        if let Some(budget) = state
            .budgets
            .get_mut(&(tenant_id.to_string(), global_model_id.to_string()))
        {
            budget.current_month_spend += amount;
        }
    }

    async fn list_all_global_models(&self) -> Vec<GlobalModel> {
        self.state.read().await.global_models.values().cloned().collect()
    }
}

/// Result of resolving a requested model id.
pub struct Resolution {
    pub global_model: GlobalModel,
    pub provider_models: Vec<ProviderModel>,
    /// Index of the alias this global model came from, if the request
    /// was resolved through `canonical-aliases`; `None` for a direct hit.
    pub alias_position: Option<u32>,
}

/// Read-facing front end over a [`RegistryStore`], plus the semantic
/// alias table, resolved strictly to canonical ids (see DESIGN.md).
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn RegistryStore>,
    aliases: HashMap<String, Vec<String>>,
    staleness_horizon: Duration,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>, aliases: HashMap<String, Vec<String>>, staleness_horizon: Duration) -> Self {
        Self {
            store,
            aliases,
            staleness_horizon,
        }
    }

    /// `ResolveModel(requested-id) -> GlobalModel + list<ProviderModel>`.
    /// Returns one [`Resolution`] per matching canonical id (more than
    /// one when `requested_id` is an alias).
    pub async fn resolve(&self, requested_id: &str) -> Result<Vec<Resolution>, CoreError> {
        if let Some(canonical_ids) = self.aliases.get(requested_id) {
            let mut resolutions = Vec::with_capacity(canonical_ids.len());
            for (position, canonical_id) in canonical_ids.iter().enumerate() {
                if let Some(global_model) = self.store.get_global_model(canonical_id).await {
                    let provider_models = self
                        .usable_provider_models(&global_model.id)
                        .await;
                    resolutions.push(Resolution {
                        global_model,
                        provider_models,
                        alias_position: Some(position as u32),
                    });
                }
            }
            if resolutions.is_empty() {
                return Err(CoreError::ModelNotFound(requested_id.to_string()));
            }
            return Ok(resolutions);
        }

        let Some(global_model) = self.store.get_global_model(requested_id).await else {
            return Err(CoreError::ModelNotFound(requested_id.to_string()));
        };
        let provider_models = self.usable_provider_models(&global_model.id).await;
        Ok(vec![Resolution {
            global_model,
            provider_models,
            alias_position: None,
        }])
    }

    async fn usable_provider_models(&self, global_model_id: &str) -> Vec<ProviderModel> {
        self.store
            .list_provider_models(global_model_id)
            .await
            .into_iter()
            .filter(|pm| pm.is_usable(self.staleness_horizon))
            .collect()
    }

    /// Direct canonical-id lookup, bypassing alias resolution — used by
    /// the orchestrator to price a candidate it already committed to.
    pub async fn get_global_model(&self, id: &str) -> Option<GlobalModel> {
        self.store.get_global_model(id).await
    }

    pub async fn tenant_budget(&self, tenant_id: &str, global_model_id: &str) -> Option<TenantBudget> {
        self.store.get_tenant_budget(tenant_id, global_model_id).await
    }

    pub async fn record_spend(&self, tenant_id: &str, global_model_id: &str, amount: f64) {
        self.store.record_spend(tenant_id, global_model_id, amount).await;
    }

    pub async fn list_models(&self) -> Vec<GlobalModel> {
        self.store.list_all_global_models().await
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }
}
