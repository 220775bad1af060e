//! Runs one request against the Router's candidate list: attempt,
//! classify, record, rotate-or-commit.
//!
//! A single attempt loop walks [`crate::router::Router::get_candidates`]
//! end to end, with quota incrementing and health recording folded into
//! every attempt rather than kept as separate metrics bookkeeping.
//!
//! The streaming half never rotates providers mid-stream once output
//! has reached the caller. The stream-commitment rule — once the first
//! chunk has been forwarded to the caller, a failure aborts rather than
//! silently retrying on a different provider — is deliberate: silently
//! resuming a partial reply on a different provider would produce an
//! incoherent response.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{AdapterError, AttemptError, CoreError, Outcome};
use crate::health::HealthStore;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{Adapter, AdapterStream};
use crate::quota::QuotaStore;
use crate::registry::{Candidate, GlobalModel, ProviderId};
use crate::router::Router;

/// Exponential-backoff retry policy applied *within* a single
/// candidate's attempt, before any bytes have reached the caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

fn should_retry(outcome: Outcome) -> bool {
    matches!(outcome, Outcome::RateLimit | Outcome::ServerError | Outcome::TransportError)
}

pub struct Orchestrator {
    router: Router,
    adapters: DashMap<ProviderId, Arc<dyn Adapter>>,
    retry_policy: RetryPolicy,
    quota_window: Duration,
}

impl Orchestrator {
    pub fn new(router: Router, retry_policy: RetryPolicy, quota_window: Duration) -> Self {
        Self {
            router,
            adapters: DashMap::new(),
            retry_policy,
            quota_window,
        }
    }

    pub fn register_adapter(&self, provider_id: ProviderId, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(provider_id, adapter);
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn health(&self) -> &Arc<HealthStore> {
        self.router.health()
    }

    fn quota(&self) -> &Arc<QuotaStore> {
        self.router.quota()
    }

    fn adapter_for(&self, provider_id: &ProviderId) -> Result<Arc<dyn Adapter>, CoreError> {
        self.adapters
            .get(provider_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::UnknownProvider(provider_id.clone()))
    }

    /// One candidate's worth of retried unary attempts, classifying and
    /// recording the terminal outcome against [`HealthStore`].
    async fn attempt_unary(
        &self,
        candidate: &Candidate,
        request: &ChatRequest,
        cancellation: &CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let adapter = match self.adapter_for(&candidate.provider_id) {
            Ok(adapter) => adapter,
            Err(_) => return Err(AdapterError::UnsupportedRequest("no adapter registered".to_string())),
        };

        let mut delay = self.retry_policy.initial_delay;
        let mut attempt = 0u32;

        loop {
            match adapter.chat_completion(request.clone(), cancellation.clone()).await {
                Ok(response) => {
                    self.health().record_outcome(&candidate.provider_id, Outcome::Success);
                    return Ok(response);
                }
                Err(error) => {
                    let outcome = error.classify();
                    // Cancellation is neither retried nor recorded against health:
                    // it reflects the caller giving up, not the provider
                    // misbehaving.
                    if outcome == Outcome::Cancelled {
                        return Err(error);
                    }
                    attempt += 1;
                    if attempt > self.retry_policy.max_retries || !should_retry(outcome) {
                        self.health().record_outcome(&candidate.provider_id, outcome);
                        return Err(error);
                    }
                    let jitter = delay.mul_f64(self.retry_policy.jitter_factor);
                    tokio::time::sleep(delay + jitter).await;
                    delay = std::cmp::min(
                        delay.mul_f64(self.retry_policy.backoff_multiplier),
                        self.retry_policy.max_delay,
                    );
                }
            }
        }
    }

    /// Runs the full attempt protocol for a unary chat completion:
    /// `GetCandidates` -> quota-increment -> attempt (with in-attempt
    /// retry) -> record -> rotate on failure, aggregating every
    /// rejected candidate into `AllCandidatesFailed` if none succeed.
    ///
    /// `cancellation` is raced against every attempt; a token firing
    /// mid-attempt short-circuits immediately to [`CoreError::Cancelled`]
    /// instead of rotating to the next candidate.
    pub async fn execute(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse, CoreError> {
        let candidates = self
            .router
            .get_candidates(
                &request.model,
                non_empty(&request.tenant_id),
                request.preferred_provider.as_deref(),
            )
            .await?;

        if candidates.is_empty() {
            return Err(CoreError::NoCandidates(request.model.clone()));
        }

        let mut attempts = Vec::new();

        for candidate in &candidates {
            if cancellation.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let quota = self.quota().check_and_increment(
                &candidate.provider_id,
                self.quota_window,
                candidate.rate_limit_rpm,
            );
            if !quota.allowed {
                attempts.push(AttemptError {
                    provider: candidate.provider_id.clone(),
                    kind: "quota_exhausted",
                    status: None,
                    message: "provider quota exhausted between candidate selection and attempt".to_string(),
                });
                continue;
            }

            match self.attempt_unary(candidate, &request, &cancellation).await {
                Ok(response) => {
                    let global_model = self.router.registry().get_global_model(&candidate.global_model_id).await;
                    let cost = estimate_cost(&response, global_model.as_ref());
                    self.router
                        .registry()
                        .record_spend(non_empty(&request.tenant_id).unwrap_or(""), &candidate.global_model_id, cost)
                        .await;
                    return Ok(response);
                }
                Err(error) => {
                    if matches!(error, AdapterError::Cancelled) {
                        return Err(CoreError::Cancelled);
                    }
                    attempts.push(to_attempt_error(&candidate.provider_id, &error));
                }
            }
        }

        Err(CoreError::AllCandidatesFailed(attempts))
    }

    /// Runs the attempt protocol for a streaming chat completion,
    /// enforcing the stream-commitment rule: rotation between
    /// candidates is only allowed before the first chunk of a given
    /// attempt has been yielded. Once committed, any later error
    /// surfaces as [`CoreError::StreamAborted`] instead of moving to
    /// the next candidate.
    pub async fn execute_streaming(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<impl futures::Stream<Item = Result<crate::models::StreamChunk, CoreError>> + Send, CoreError> {
        let candidates = self
            .router
            .get_candidates(
                &request.model,
                non_empty(&request.tenant_id),
                request.preferred_provider.as_deref(),
            )
            .await?;

        if candidates.is_empty() {
            return Err(CoreError::NoCandidates(request.model.clone()));
        }

        Ok(stream_candidates(
            self.adapters_snapshot(),
            self.health().clone(),
            self.quota().clone(),
            self.quota_window,
            candidates,
            request,
            cancellation,
        ))
    }

    fn adapters_snapshot(&self) -> DashMap<ProviderId, Arc<dyn Adapter>> {
        let snapshot = DashMap::new();
        for entry in self.adapters.iter() {
            snapshot.insert(entry.key().clone(), entry.value().clone());
        }
        snapshot
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn to_attempt_error(provider: &ProviderId, error: &AdapterError) -> AttemptError {
    let (kind, status): (&'static str, Option<u16>) = match error {
        AdapterError::UpstreamClientError { status, .. } => ("client_error", Some(*status)),
        AdapterError::UpstreamAuthError { status, .. } => ("auth_error", Some(*status)),
        AdapterError::UpstreamRateLimit { status, .. } => ("rate_limit", Some(*status)),
        AdapterError::UpstreamServerError { status, .. } => ("server_error", Some(*status)),
        AdapterError::TransportError(_) => ("transport_error", None),
        AdapterError::UnsupportedRequest(_) => ("unsupported_request", None),
        AdapterError::InvalidResponse(_) => ("invalid_response", None),
        AdapterError::Cancelled => ("cancelled", None),
        AdapterError::Http(_) => ("transport_error", None),
        AdapterError::Serialization(_) => ("invalid_response", None),
    };
    AttemptError {
        provider: provider.clone(),
        kind,
        status,
        message: error.to_string(),
    }
}

/// `cost = input-price·input-tokens + output-price·output-tokens`,
/// prices in dollars per million tokens. Falls back to a ~4-chars-per-
/// token estimate of completion tokens when the response carries no
/// usage block, and to zero cost when the candidate's `GlobalModel` has
/// since disappeared from the registry (nothing to price against). A
/// free-tier model (price 0 either side) always prices to exactly 0.
fn estimate_cost(response: &ChatResponse, global_model: Option<&GlobalModel>) -> f64 {
    let Some(model) = global_model else {
        return 0.0;
    };

    let (prompt_tokens, completion_tokens) = match &response.usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
        None => {
            let completion_tokens = response
                .choices
                .iter()
                .map(|c| c.message.content.len() as u32 / 4)
                .sum();
            (0, completion_tokens)
        }
    };

    (prompt_tokens as f64 * model.input_price_per_million + completion_tokens as f64 * model.output_price_per_million)
        / 1_000_000.0
}

fn stream_candidates(
    adapters: DashMap<ProviderId, Arc<dyn Adapter>>,
    health: Arc<HealthStore>,
    quota: Arc<QuotaStore>,
    quota_window: Duration,
    candidates: Vec<Candidate>,
    request: ChatRequest,
    cancellation: CancellationToken,
) -> impl futures::Stream<Item = Result<crate::models::StreamChunk, CoreError>> + Send {
    stream! {
        let mut attempts = Vec::new();
        let mut committed = false;

        'candidates: for candidate in candidates {
            if cancellation.is_cancelled() {
                yield Err(CoreError::Cancelled);
                return;
            }

            let check = quota.check_and_increment(&candidate.provider_id, quota_window, candidate.rate_limit_rpm);
            if !check.allowed {
                attempts.push(AttemptError {
                    provider: candidate.provider_id.clone(),
                    kind: "quota_exhausted",
                    status: None,
                    message: "provider quota exhausted between candidate selection and attempt".to_string(),
                });
                continue;
            }

            let Some(adapter) = adapters.get(&candidate.provider_id).map(|e| e.value().clone()) else {
                attempts.push(AttemptError {
                    provider: candidate.provider_id.clone(),
                    kind: "unknown_provider",
                    status: None,
                    message: "no adapter registered for provider".to_string(),
                });
                continue;
            };

            let mut upstream = match adapter.stream_chat_completion(request.clone(), cancellation.clone()).await {
                Ok(upstream) => upstream,
                Err(error) => {
                    // Cancellation rotates to nothing: the caller gave up, so
                    // this isn't evidence against the provider either.
                    if matches!(error, AdapterError::Cancelled) {
                        yield Err(CoreError::Cancelled);
                        return;
                    }
                    health.record_outcome(&candidate.provider_id, error.classify());
                    attempts.push(to_attempt_error(&candidate.provider_id, &error));
                    continue 'candidates;
                }
            };

            let mut this_attempt_committed = false;
            while let Some(item) = futures::StreamExt::next(&mut upstream).await {
                match item {
                    Ok(chunk) => {
                        if !this_attempt_committed {
                            health.record_outcome(&candidate.provider_id, Outcome::Success);
                        }
                        committed = true;
                        this_attempt_committed = true;
                        yield Ok(chunk);
                    }
                    Err(error) => {
                        if matches!(error, AdapterError::Cancelled) {
                            // Once committed this is still surfaced as an abort
                            // rather than a silent drop, but it carries no health
                            // penalty — the caller walked away, the provider
                            // didn't misbehave.
                            yield Err(CoreError::Cancelled);
                            return;
                        }
                        if this_attempt_committed {
                            yield Err(CoreError::StreamAborted(error));
                            return;
                        }
                        health.record_outcome(&candidate.provider_id, error.classify());
                        attempts.push(to_attempt_error(&candidate.provider_id, &error));
                        continue 'candidates;
                    }
                }
            }

            if this_attempt_committed {
                return;
            }
        }

        if !committed {
            yield Err(CoreError::AllCandidatesFailed(attempts));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CircuitCooldowns, HealthStore};
    use crate::quota::QuotaStore;
    use crate::registry::{Capabilities, InMemoryRegistryStore, ProviderModel, Registry, TenantBudget};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;

    struct FlakyThenOkAdapter {
        calls: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait]
    impl Adapter for FlakyThenOkAdapter {
        fn family(&self) -> &'static str {
            "test"
        }
        fn supports_streaming(&self) -> bool {
            false
        }
        async fn chat_completion(
            &self,
            request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<ChatResponse, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(AdapterError::UpstreamServerError {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(ChatResponse {
                id: "r".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model,
                choices: vec![],
                usage: None,
                system_fingerprint: None,
            })
        }
        async fn stream_chat_completion(
            &self,
            _request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<AdapterStream, AdapterError> {
            unimplemented!()
        }
    }

    struct AlwaysFailsAdapter;

    #[async_trait]
    impl Adapter for AlwaysFailsAdapter {
        fn family(&self) -> &'static str {
            "test"
        }
        fn supports_streaming(&self) -> bool {
            false
        }
        async fn chat_completion(
            &self,
            _request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<ChatResponse, AdapterError> {
            Err(AdapterError::UpstreamAuthError {
                status: 401,
                body: "no".to_string(),
            })
        }
        async fn stream_chat_completion(
            &self,
            _request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<AdapterStream, AdapterError> {
            unimplemented!()
        }
    }

    struct CancellableAdapter;

    #[async_trait]
    impl Adapter for CancellableAdapter {
        fn family(&self) -> &'static str {
            "test"
        }
        fn supports_streaming(&self) -> bool {
            false
        }
        async fn chat_completion(
            &self,
            _request: ChatRequest,
            cancellation: CancellationToken,
        ) -> Result<ChatResponse, AdapterError> {
            cancellation.cancelled().await;
            Err(AdapterError::Cancelled)
        }
        async fn stream_chat_completion(
            &self,
            _request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<AdapterStream, AdapterError> {
            unimplemented!()
        }
    }

    async fn seeded_orchestrator() -> Orchestrator {
        let store = Arc::new(InMemoryRegistryStore::new());
        store
            .upsert_global_model(GlobalModel {
                id: "m-lite".to_string(),
                display_name: "m-lite".to_string(),
                context_window: 8192,
                input_price_per_million: 0.0,
                output_price_per_million: 0.0,
                capabilities: Capabilities::default(),
                last_sync: SystemTime::now(),
            })
            .await;
        store
            .upsert_provider_model(ProviderModel {
                provider_id: ProviderId::from("flaky"),
                provider_model_id: "flaky/m-lite".to_string(),
                global_model_id: "m-lite".to_string(),
                available: true,
                last_seen: SystemTime::now(),
                rate_limit_rpm: None,
                successes: 5,
                failures: 0,
                p95_latency_ms: Some(50),
            })
            .await;
        store
            .upsert_provider_model(ProviderModel {
                provider_id: ProviderId::from("down"),
                provider_model_id: "down/m-lite".to_string(),
                global_model_id: "m-lite".to_string(),
                available: true,
                last_seen: SystemTime::now(),
                rate_limit_rpm: None,
                successes: 5,
                failures: 0,
                p95_latency_ms: Some(50),
            })
            .await;

        let registry = Registry::new(store, HashMap::new(), Duration::from_secs(3600));
        let health = HealthStore::new(CircuitCooldowns::default());
        let quota = QuotaStore::new();
        let router = Router::new(
            registry,
            health,
            quota,
            crate::router::RouterWeights::default(),
            Duration::from_secs(60),
        );
        let mut retry_policy = RetryPolicy::default();
        retry_policy.initial_delay = Duration::from_millis(1);
        retry_policy.max_delay = Duration::from_millis(2);

        let orchestrator = Orchestrator::new(router, retry_policy, Duration::from_secs(60));
        orchestrator.register_adapter(
            ProviderId::from("flaky"),
            Arc::new(FlakyThenOkAdapter {
                calls: AtomicUsize::new(0),
                fail_times: 1,
            }),
        );
        orchestrator.register_adapter(ProviderId::from("down"), Arc::new(AlwaysFailsAdapter));
        orchestrator
    }

    #[tokio::test]
    async fn retries_within_one_attempt_before_succeeding() {
        let orchestrator = seeded_orchestrator().await;
        let request = ChatRequest {
            model: "m-lite".to_string(),
            preferred_provider: Some("flaky".to_string()),
            ..Default::default()
        };
        let response = orchestrator
            .execute(request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.model, "m-lite");
    }

    #[tokio::test]
    async fn auth_error_does_not_retry_and_rotates_to_next_candidate() {
        let orchestrator = seeded_orchestrator().await;
        let request = ChatRequest {
            model: "m-lite".to_string(),
            preferred_provider: Some("down".to_string()),
            ..Default::default()
        };
        let response = orchestrator
            .execute(request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.model, "m-lite");
    }

    #[tokio::test]
    async fn model_with_no_candidates_at_all_is_no_candidates() {
        let orchestrator = seeded_orchestrator().await;
        let request = ChatRequest {
            model: "nonexistent".to_string(),
            ..Default::default()
        };
        let err = orchestrator
            .execute(request, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn cancelling_mid_attempt_short_circuits_without_rotating_or_penalizing_health() {
        let orchestrator = seeded_orchestrator().await;
        orchestrator.register_adapter(ProviderId::from("flaky"), Arc::new(CancellableAdapter));

        let token = CancellationToken::new();
        token.cancel();
        let request = ChatRequest {
            model: "m-lite".to_string(),
            preferred_provider: Some("flaky".to_string()),
            ..Default::default()
        };

        let err = orchestrator.execute(request, token).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));

        let record = orchestrator.router().health().check_health(&ProviderId::from("flaky"));
        assert_eq!(record.circuit, crate::health::CircuitState::Closed);
        assert_eq!(record.success_rate, 1.0);
    }

    struct UsageAdapter {
        usage: crate::models::Usage,
    }

    #[async_trait]
    impl Adapter for UsageAdapter {
        fn family(&self) -> &'static str {
            "test"
        }
        fn supports_streaming(&self) -> bool {
            false
        }
        async fn chat_completion(
            &self,
            request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<ChatResponse, AdapterError> {
            Ok(ChatResponse {
                id: "r".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model,
                choices: vec![],
                usage: Some(crate::models::Usage {
                    prompt_tokens: self.usage.prompt_tokens,
                    completion_tokens: self.usage.completion_tokens,
                    total_tokens: self.usage.prompt_tokens + self.usage.completion_tokens,
                    estimated: false,
                }),
                system_fingerprint: None,
            })
        }
        async fn stream_chat_completion(
            &self,
            _request: ChatRequest,
            _cancellation: CancellationToken,
        ) -> Result<AdapterStream, AdapterError> {
            unimplemented!()
        }
    }

    async fn priced_orchestrator(input_price: f64, output_price: f64, usage: crate::models::Usage) -> Orchestrator {
        let store = Arc::new(InMemoryRegistryStore::new());
        store
            .upsert_global_model(GlobalModel {
                id: "m-priced".to_string(),
                display_name: "m-priced".to_string(),
                context_window: 8192,
                input_price_per_million: input_price,
                output_price_per_million: output_price,
                capabilities: Capabilities::default(),
                last_sync: SystemTime::now(),
            })
            .await;
        store
            .upsert_provider_model(ProviderModel {
                provider_id: ProviderId::from("priced"),
                provider_model_id: "priced/m-priced".to_string(),
                global_model_id: "m-priced".to_string(),
                available: true,
                last_seen: SystemTime::now(),
                rate_limit_rpm: None,
                successes: 5,
                failures: 0,
                p95_latency_ms: Some(50),
            })
            .await;
        store
            .upsert_tenant_budget(TenantBudget {
                tenant_id: "acme".to_string(),
                global_model_id: "m-priced".to_string(),
                allowed_rpm: None,
                monthly_budget: 1000.0,
                current_month_spend: 0.0,
            })
            .await;

        let registry = Registry::new(store, HashMap::new(), Duration::from_secs(3600));
        let health = HealthStore::new(CircuitCooldowns::default());
        let quota = QuotaStore::new();
        let router = Router::new(registry, health, quota, crate::router::RouterWeights::default(), Duration::from_secs(60));
        let orchestrator = Orchestrator::new(router, RetryPolicy::default(), Duration::from_secs(60));
        orchestrator.register_adapter(ProviderId::from("priced"), Arc::new(UsageAdapter { usage }));
        orchestrator
    }

    #[tokio::test]
    async fn successful_attempt_accrues_price_weighted_spend() {
        let orchestrator = priced_orchestrator(
            10.0,
            30.0,
            crate::models::Usage {
                prompt_tokens: 1_000,
                completion_tokens: 500,
                total_tokens: 1_500,
                estimated: false,
            },
        )
        .await;
        let request = ChatRequest {
            model: "m-priced".to_string(),
            tenant_id: "acme".to_string(),
            preferred_provider: Some("priced".to_string()),
            ..Default::default()
        };
        orchestrator.execute(request, CancellationToken::new()).await.unwrap();

        let budget = orchestrator
            .router()
            .registry()
            .tenant_budget("acme", "m-priced")
            .await
            .unwrap();
        // (1000*10 + 500*30) / 1_000_000 = 0.025
        assert!((budget.current_month_spend - 0.025).abs() < 1e-9);
    }

    #[tokio::test]
    async fn free_model_success_accrues_zero_spend() {
        let orchestrator = priced_orchestrator(
            0.0,
            0.0,
            crate::models::Usage {
                prompt_tokens: 1_000,
                completion_tokens: 500,
                total_tokens: 1_500,
                estimated: false,
            },
        )
        .await;
        let request = ChatRequest {
            model: "m-priced".to_string(),
            tenant_id: "acme".to_string(),
            preferred_provider: Some("priced".to_string()),
            ..Default::default()
        };
        orchestrator.execute(request, CancellationToken::new()).await.unwrap();

        let budget = orchestrator
            .router()
            .registry()
            .tenant_budget("acme", "m-priced")
            .await
            .unwrap();
        assert_eq!(budget.current_month_spend, 0.0);
    }
}
