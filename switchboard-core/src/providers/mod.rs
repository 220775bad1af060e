//! Adapter layer: one implementation per upstream wire-format family.
//!
//! One implementation per named vendor, generalized down to the five
//! wire-format families the gateway actually has to speak: OpenAI-shaped,
//! Google-shaped,
//! Cohere-shaped, Cloudflare-shaped, and prompt-collapse. A vendor that
//! shares a family's wire format (Groq, Mistral, OpenRouter, Perplexity,
//! Azure OpenAI all being OpenAI-shaped) needs no adapter of its own —
//! only a distinct [`AdapterConfig`] (base URL, auth, model mapping).

use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod cloudflare_shaped;
pub mod cohere_shaped;
pub mod google_shaped;
pub mod http_client;
pub mod openai_shaped;
pub mod prompt_collapse;

/// A pinned boxed stream of chat chunks or mid-stream adapter errors.
pub type AdapterStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AdapterError>> + Send>>;

/// Uniform unary/streaming interface over one upstream wire-format
/// family. Health and quota bookkeeping live outside the adapter, in
/// [`crate::health`] and [`crate::quota`]; an adapter only ever
/// translates and transports.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Wire-format family identifier, e.g. `"openai-shaped"`.
    fn family(&self) -> &'static str;

    fn supports_streaming(&self) -> bool;

    /// Unary chat completion. `cancellation` is raced against the
    /// upstream call; a token that fires mid-call yields
    /// [`AdapterError::Cancelled`] and must tear down the in-flight
    /// connection rather than let it run to completion unobserved.
    async fn chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse, AdapterError>;

    /// Streaming chat completion. Dropping the returned stream, or
    /// firing `cancellation`, must cancel the upstream transport.
    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<AdapterStream, AdapterError>;
}

/// Per-provider adapter configuration: one of these per
/// [`crate::registry::ProviderId`], supplying the transport details a
/// shared family implementation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Wire-format family to instantiate: one of `openai-shaped`,
    /// `google-shaped`, `cohere-shaped`, `cloudflare-shaped`,
    /// `prompt-collapse`.
    pub family: String,
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "crate::common::duration_serde")]
    pub retry_delay: Duration,
    /// Client model name -> provider model name, e.g. `"gpt-4o"` ->
    /// `"llama3-70b-8192"` when aliasing through Groq.
    pub model_mapping: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    /// Cloudflare-shaped only: account id segment in the request path.
    pub account_id: Option<String>,
    /// Forces every candidate served by this provider into the free tier
    /// regardless of the registry's stored `GlobalModel` price.
    #[serde(default)]
    pub is_free: bool,
}

impl AdapterConfig {
    pub fn new(family: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            api_key: api_key.into(),
            base_url: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            model_mapping: HashMap::new(),
            headers: HashMap::new(),
            account_id: None,
            is_free: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }
}

/// Instantiates the adapter named by `config.family`.
pub fn create_adapter(config: AdapterConfig) -> Result<Box<dyn Adapter>, AdapterError> {
    match config.family.as_str() {
        "openai-shaped" => Ok(Box::new(openai_shaped::OpenAiShapedAdapter::new(config)?)),
        "google-shaped" => Ok(Box::new(google_shaped::GoogleShapedAdapter::new(config)?)),
        "cohere-shaped" => Ok(Box::new(cohere_shaped::CohereShapedAdapter::new(config)?)),
        "cloudflare-shaped" => Ok(Box::new(cloudflare_shaped::CloudflareShapedAdapter::new(
            config,
        )?)),
        "prompt-collapse" => Ok(Box::new(prompt_collapse::PromptCollapseAdapter::new(
            config,
        )?)),
        other => Err(AdapterError::UnsupportedRequest(format!(
            "no adapter for wire-format family {other}"
        ))),
    }
}
