//! # HTTP Server Module
//!
//! Wires a loaded [`Config`] into the `switchboard-core` request-execution
//! core (registry, health store, quota store, router, orchestrator),
//! registers one adapter per configured provider, and exposes three
//! routes. HTTP framing, authentication, rate limiting, and CORS are
//! assumed handled by an edge layer in front of this service, so there
//! is no auth/CORS/rate-limiting/admin/metrics/websocket surface here.
//!
//! ## API Endpoints
//!
//! - `POST /v1/chat/completions` — unary or SSE-streaming chat completion
//! - `GET /v1/models` — the registry's current model listing
//! - `GET /health` — liveness probe

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router as AxumRouter;
use tower_http::trace::TraceLayer;

use switchboard_core::health::HealthStore;
use switchboard_core::orchestrator::{Orchestrator, RetryPolicy};
use switchboard_core::quota::QuotaStore;
use switchboard_core::registry::{InMemoryRegistryStore, ProviderId, Registry};
use switchboard_core::router::Router as SmartRouter;

use crate::config::Config;
use crate::handlers;

/// Shared state every handler extracts from. `registry` is also held
/// directly (not only reachable through `orchestrator`) so `list_models`
/// doesn't need to thread a request through the router/quota machinery
/// just to read the catalog.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Registry,
}

/// Builds the full request-execution core from `config` and assembles
/// the axum [`AxumRouter`]. Registry backing store is always
/// [`InMemoryRegistryStore`] here; the embedding application is free to
/// substitute a persistent store by constructing `Registry` itself and
/// skipping this helper.
///
/// This does not spawn `CatalogSync`/`ProviderDiscovery`: both are
/// library types that need a concrete `CatalogSource`/`DiscoverySource`
/// (an external catalog feed, a provider's model-listing endpoint). A
/// deployment that has one wires it up explicitly against
/// `state.registry.store()`.
pub async fn create_server(config: Config) -> anyhow::Result<AxumRouter> {
    let config = Arc::new(config);

    let store = Arc::new(InMemoryRegistryStore::new());
    let registry = Registry::new(
        store,
        config.canonical_aliases.clone(),
        config.registry_sync.staleness_horizon,
    );
    let health = HealthStore::new(config.circuit_breaker.cooldown_by_class.clone());
    let quota = QuotaStore::new();
    let force_free = config
        .providers
        .iter()
        .filter(|(_, adapter_config)| adapter_config.is_free)
        .map(|(name, _)| (ProviderId::from(name.clone()), true))
        .collect();
    let smart_router = SmartRouter::with_force_free(
        registry.clone(),
        health,
        quota,
        config.router.weights.clone(),
        config.quota.window,
        force_free,
    );

    let retry_policy = RetryPolicy::default();
    let orchestrator = Arc::new(Orchestrator::new(smart_router, retry_policy, config.quota.window));

    for (provider_name, adapter_config) in &config.providers {
        let adapter = switchboard_core::providers::create_adapter(adapter_config.clone())
            .map_err(|e| anyhow::anyhow!("failed to build adapter for provider {provider_name}: {e}"))?;
        orchestrator.register_adapter(ProviderId::from(provider_name.clone()), Arc::from(adapter));
    }

    let state = AppState {
        config: config.clone(),
        orchestrator,
        registry,
    };

    let app = AxumRouter::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(config.server.timeout))
        .with_state(state);

    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::providers::AdapterConfig;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.providers.insert(
            "openai".to_string(),
            AdapterConfig::new("openai-shaped", "test-key"),
        );
        config
    }

    #[tokio::test]
    async fn create_server_builds_router_for_valid_config() {
        let app = create_server(test_config()).await;
        assert!(app.is_ok());
    }

    #[tokio::test]
    async fn create_server_rejects_unknown_adapter_family() {
        let mut config = test_config();
        config.providers.insert(
            "broken".to_string(),
            AdapterConfig::new("not-a-real-family", "test-key"),
        );
        let app = create_server(config).await;
        assert!(app.is_err());
    }
}
