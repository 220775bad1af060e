//! HTTP handlers: the thin translation layer between axum and
//! `switchboard-core`. Three operations: chat completion (unary and
//! streaming), model listing, and a health probe. No embeddings/images/
//! audio/speech/legacy-completions or admin/dashboard/metrics surface.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use switchboard_core::models::ChatRequest;
use switchboard_core::registry::GlobalModel;

use crate::gateway_error::GatewayError;
use crate::request_context::RequestContext;
use crate::server::AppState;

/// `chat-completion(request-envelope) -> response-envelope`, dispatching
/// to the streaming path when the caller asks for one. Every attempt
/// chain runs inside a tracing span carrying the request's correlation
/// id (caller-supplied, or freshly generated) so the router/orchestrator
/// logs for one request can be grepped out of the rest.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> axum::response::Response {
    let ctx = RequestContext::new();
    let correlation_id = request.correlation_id.clone().unwrap_or_else(|| ctx.request_id.clone());
    let span = tracing::info_span!("chat_completion", correlation_id = %correlation_id, model = %request.model);

    if request.stream == Some(true) {
        return streaming_chat_completions(state, request).instrument(span).await.into_response();
    }

    async move {
        let result = state
            .orchestrator
            .execute(request, CancellationToken::new())
            .await;
        tracing::debug!(duration_ms = ctx.duration().as_millis() as u64, ok = result.is_ok(), "chat completion attempt chain finished");
        match result {
            Ok(response) => Json(response).into_response(),
            Err(error) => GatewayError::from(error).into_response(),
        }
    }
    .instrument(span)
    .await
}

/// Server-sent-events variant of `chat-completion`, forwarding every
/// `StreamChunk` as a `data:` event and terminating on `[DONE]`. A
/// mid-stream abort is surfaced as one last `error` event carrying the
/// canonical error body rather than a silent close.
async fn streaming_chat_completions(
    state: AppState,
    request: ChatRequest,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        match state.orchestrator.execute_streaming(request, CancellationToken::new()).await {
            Ok(mut chunks) => {
                while let Some(item) = futures::StreamExt::next(&mut chunks).await {
                    match item {
                        Ok(chunk) => {
                            yield Ok(Event::default().json_data(chunk).unwrap_or_else(|_| Event::default()));
                        }
                        Err(error) => {
                            let body = GatewayError::from(error).to_json();
                            yield Ok(Event::default().event("error").json_data(body).unwrap_or_else(|_| Event::default()));
                            return;
                        }
                    }
                }
                yield Ok(Event::default().data("[DONE]"));
            }
            Err(error) => {
                let body = GatewayError::from(error).to_json();
                yield Ok(Event::default().event("error").json_data(body).unwrap_or_else(|_| Event::default()));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Serialize)]
struct ModelCapabilities {
    tools: bool,
    vision: bool,
    streaming: bool,
}

#[derive(Serialize)]
struct ModelSummary {
    id: String,
    context_window: u32,
    capabilities: ModelCapabilities,
    is_free: bool,
}

impl From<GlobalModel> for ModelSummary {
    fn from(model: GlobalModel) -> Self {
        Self {
            id: model.id.clone(),
            context_window: model.context_window,
            capabilities: ModelCapabilities {
                tools: model.capabilities.tools,
                vision: model.capabilities.vision,
                streaming: model.capabilities.streaming,
            },
            is_free: model.is_free(),
        }
    }
}

#[derive(Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelSummary>,
}

/// `list-models() -> list<{id, context-window, capabilities, is-free}>`,
/// sourced directly from the registry rather than a hardcoded
/// per-vendor table.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let models = state.registry.list_models().await;
    Json(ModelList {
        object: "list",
        data: models.into_iter().map(ModelSummary::from).collect(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use switchboard_core::health::{CircuitCooldowns, HealthStore};
    use switchboard_core::orchestrator::{Orchestrator, RetryPolicy};
    use switchboard_core::quota::QuotaStore;
    use switchboard_core::registry::{Capabilities, InMemoryRegistryStore, Registry};
    use switchboard_core::router::{Router, RouterWeights};

    async fn test_state() -> AppState {
        let store = Arc::new(InMemoryRegistryStore::new());
        store
            .upsert_global_model(GlobalModel {
                id: "m-lite".to_string(),
                display_name: "m-lite".to_string(),
                context_window: 8192,
                input_price_per_million: 0.0,
                output_price_per_million: 0.0,
                capabilities: Capabilities {
                    tools: true,
                    vision: false,
                    streaming: true,
                },
                last_sync: SystemTime::now(),
            })
            .await;

        let registry = Registry::new(store, HashMap::new(), Duration::from_secs(3600));
        let health = HealthStore::new(CircuitCooldowns::default());
        let quota = QuotaStore::new();
        let router = Router::new(
            registry.clone(),
            health,
            quota,
            RouterWeights::default(),
            Duration::from_secs(60),
        );
        let orchestrator = Arc::new(Orchestrator::new(router, RetryPolicy::default(), Duration::from_secs(60)));

        AppState {
            config: Arc::new(Config::default()),
            orchestrator,
            registry,
        }
    }

    #[tokio::test]
    async fn list_models_reflects_registry_contents() {
        let state = test_state().await;
        let Json(list) = list_models(State(state)).await;
        assert_eq!(list.data.len(), 1);
        assert_eq!(list.data[0].id, "m-lite");
        assert!(list.data[0].is_free);
        assert!(list.data[0].capabilities.tools);
    }

    #[tokio::test]
    async fn chat_completions_surfaces_model_not_found_as_bad_request() {
        let state = test_state().await;
        let request = ChatRequest {
            model: "nonexistent".to_string(),
            ..Default::default()
        };
        let response = chat_completions(State(state), Json(request)).await;
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let Json(health) = health_check().await;
        assert_eq!(health.status, "ok");
    }
}
