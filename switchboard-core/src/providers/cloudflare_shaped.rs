//! Adapter for Cloudflare Workers AI's `/accounts/{id}/ai/run/{model}`
//! wire format.
//!
//! Distinguishing quirks: the model id is a raw path segment containing
//! slashes (`@cf/meta/llama-3-8b-instruct`), not a body field, and
//! streaming frames are `data: {"response": "..."}\n\n` with a trailing
//! `data: [DONE]`, where each event carries only a raw text delta rather
//! than an OpenAI-shaped choice/delta structure. The SSE line-buffering
//! idiom follows the other adapters' streaming loops; the per-event
//! parsing is original to this wire format.

use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk,
};

use super::http_client::{map_error_response, race_cancel, AuthStrategy, HttpProviderClient};
use super::{Adapter, AdapterConfig, AdapterStream};

pub struct CloudflareShapedAdapter {
    http: HttpProviderClient,
    account_id: String,
}

impl CloudflareShapedAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let account_id = config.account_id.clone().ok_or_else(|| {
            AdapterError::UnsupportedRequest(
                "cloudflare-shaped adapter requires account_id".to_string(),
            )
        })?;
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.cloudflare.com/client/v4",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;
        Ok(Self { http, account_id })
    }

    fn run_path(&self, model: &str) -> String {
        format!("/accounts/{}/ai/run/{model}", self.account_id)
    }

    fn to_wire(request: &ChatRequest) -> CloudflareRequest {
        CloudflareRequest {
            messages: request
                .messages
                .iter()
                .map(|m| CloudflareMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User | Role::Tool => "user",
                        Role::Assistant => "assistant",
                    }
                    .to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: request.stream.unwrap_or(false),
            max_tokens: request.max_tokens,
        }
    }
}

#[async_trait::async_trait]
impl Adapter for CloudflareShapedAdapter {
    fn family(&self) -> &'static str {
        "cloudflare-shaped"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let mut wire = Self::to_wire(&request);
        wire.stream = false;
        let path = self.run_path(&request.model);
        let envelope: CloudflareEnvelope =
            race_cancel(self.http.post_json(&path, &wire), &cancellation).await?;
        if !envelope.success {
            return Err(AdapterError::InvalidResponse(
                envelope
                    .errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }

        Ok(ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(envelope.result.response),
                finish_reason: Some("stop".to_string()),
                logprobs: None,
            }],
            usage: None,
            system_fingerprint: None,
        })
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<AdapterStream, AdapterError> {
        let mut wire = Self::to_wire(&request);
        wire.stream = true;
        let path = self.run_path(&request.model);

        let response = race_cancel(self.http.post_json_raw(&path, &wire), &cancellation).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let model = request.model.clone();
        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => break,
                    next = futures::StreamExt::next(&mut bytes_stream) => next,
                };
                let Some(chunk_result) = next else { break };
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            let Some(data) = line.strip_prefix("data: ") else { continue };
                            if data == "[DONE]" {
                                return;
                            }
                            // Malformed JSON in a stream frame is dropped, not fatal.
                            if let Ok(event) = serde_json::from_str::<CloudflareStreamEvent>(data) {
                                yield Ok(StreamChunk {
                                    id: uuid::Uuid::new_v4().to_string(),
                                    object: "chat.completion.chunk".to_string(),
                                    created: chrono::Utc::now().timestamp() as u64,
                                    model: model.clone(),
                                    choices: vec![StreamChoice {
                                        index: 0,
                                        delta: Delta {
                                            role: Some(Role::Assistant),
                                            content: Some(event.response),
                                            tool_calls: None,
                                        },
                                        finish_reason: None,
                                    }],
                                    usage: None,
                                });
                            }
                        }
                    }
                    Err(e) => yield Err(AdapterError::from(e)),
                }
            }
        });

        Ok(stream)
    }
}

#[derive(Serialize)]
struct CloudflareRequest {
    messages: Vec<CloudflareMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct CloudflareMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct CloudflareEnvelope {
    result: CloudflareResult,
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareApiError>,
}

#[derive(Deserialize)]
struct CloudflareResult {
    response: String,
}

#[derive(Deserialize)]
struct CloudflareApiError {
    message: String,
}

#[derive(Deserialize)]
struct CloudflareStreamEvent {
    response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_path_embeds_account_and_raw_model_slashes() {
        let config = AdapterConfig {
            account_id: Some("acct-123".to_string()),
            ..AdapterConfig::new("cloudflare-shaped", "key")
        };
        let adapter = CloudflareShapedAdapter::new(config).unwrap();
        assert_eq!(
            adapter.run_path("@cf/meta/llama-3-8b-instruct"),
            "/accounts/acct-123/ai/run/@cf/meta/llama-3-8b-instruct"
        );
    }

    #[test]
    fn missing_account_id_is_rejected_at_construction() {
        let config = AdapterConfig::new("cloudflare-shaped", "key");
        assert!(CloudflareShapedAdapter::new(config).is_err());
    }
}
