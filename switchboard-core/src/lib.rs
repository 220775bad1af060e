//! # Switchboard Core
//!
//! The request-execution core of an LLM inference gateway: a Smart
//! Router that resolves a requested model id into an ordered list of
//! `(provider, provider-specific-model)` candidates, a Fallback
//! Orchestrator that drives a request through that list preserving
//! streaming semantics across rotations, a shared Health & Quota Store,
//! a uniform Provider Adapter layer over several upstream wire-format
//! families, and a Dynamic Model Registry fed by two background
//! synchronizers.
//!
//! HTTP server framing, authentication, and configuration loading are
//! deliberately out of scope here — see the sibling `switchboard-gateway`
//! crate for those.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use switchboard_core::health::{CircuitCooldowns, HealthStore};
//! use switchboard_core::models::{ChatRequest, Message};
//! use switchboard_core::orchestrator::{Orchestrator, RetryPolicy};
//! use switchboard_core::quota::QuotaStore;
//! use switchboard_core::registry::{InMemoryRegistryStore, Registry};
//! use switchboard_core::router::{Router, RouterWeights};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryRegistryStore::new());
//! let registry = Registry::new(store, HashMap::new(), Duration::from_secs(3600));
//! let health = HealthStore::new(CircuitCooldowns::default());
//! let quota = QuotaStore::new();
//! let router = Router::new(registry, health, quota, RouterWeights::default(), Duration::from_secs(60));
//! let orchestrator = Orchestrator::new(router, RetryPolicy::default(), Duration::from_secs(60));
//!
//! let request = ChatRequest {
//!     model: "m-lite".to_string(),
//!     messages: vec![Message::user("Hello, world!")],
//!     ..Default::default()
//! };
//! let response = orchestrator.execute(request, CancellationToken::new()).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod error;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod registry_writers;
pub mod router;

pub use error::{AdapterError, AttemptError, CoreError, Outcome};
pub use health::{CircuitCooldowns, CircuitState, HealthRecord, HealthStore};
pub use models::{ChatRequest, ChatResponse, Choice, Message, Role, StreamChunk, Usage};
pub use orchestrator::{Orchestrator, RetryPolicy};
pub use providers::{create_adapter, Adapter, AdapterConfig, AdapterStream};
pub use quota::{QuotaCheck, QuotaStore};
pub use registry::{
    Candidate, Capabilities, GlobalModel, InMemoryRegistryStore, ProviderId, ProviderModel,
    Registry, RegistryStore, Resolution, TenantBudget,
};
pub use registry_writers::{CatalogSource, CatalogSync, DiscoverySource, ProviderDiscovery};
pub use router::{Router, RouterWeights};

/// Result type for core operations that can fail with a [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_role() {
        let user_msg = Message::user("Hello, world!");
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.content, "Hello, world!");

        let assistant_msg = Message::assistant("Hi there!");
        assert_eq!(assistant_msg.role, Role::Assistant);
        assert_eq!(assistant_msg.content, "Hi there!");
    }

    #[test]
    fn chat_request_default_has_no_tenant() {
        let request = ChatRequest::default();
        assert_eq!(request.model, "");
        assert_eq!(request.messages.len(), 0);
        assert!(request.tenant_id.is_empty());
    }

    #[test]
    fn router_weights_default_sums_to_one() {
        let weights = RouterWeights::default();
        let total = weights.w_tier + weights.w_health + weights.w_latency + weights.w_cost;
        assert!((total - 1.0).abs() < 1e-9);
    }
}
