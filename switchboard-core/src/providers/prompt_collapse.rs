//! Adapter for upstreams with no structured chat endpoint at all: the
//! conversation collapses into one `"role: content\n"`-per-line prompt
//! string, and the response is raw completion text with no JSON
//! envelope. Streaming is the upstream's raw byte stream, line-buffered
//! the same way the other adapters buffer SSE, but forwarded as text
//! deltas with no framing to parse, reusing the line-buffering idiom
//! shared by every other adapter's streaming loop minus any JSON
//! parsing step.

use async_stream::stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk,
};

use super::http_client::{map_error_response, race_cancel, AuthStrategy, HttpProviderClient};
use super::{Adapter, AdapterConfig, AdapterStream};

pub struct PromptCollapseAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

impl PromptCollapseAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "http://localhost:11434",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;
        Ok(Self { http, config })
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// Collapses the whole conversation into one line-per-message
    /// prompt: `"role: content\n"`, in order.
    pub fn collapse(request: &ChatRequest) -> String {
        request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                format!("{role}: {}\n", m.content)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Adapter for PromptCollapseAdapter {
    fn family(&self) -> &'static str {
        "prompt-collapse"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let model = self.map_model(&request.model);
        let wire = RawCompletionRequest {
            model: model.clone(),
            prompt: Self::collapse(&request),
            stream: false,
        };
        let response: RawCompletionResponse =
            race_cancel(self.http.post_json("/api/generate", &wire), &cancellation).await?;

        Ok(ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(response.response),
                finish_reason: Some("stop".to_string()),
                logprobs: None,
            }],
            usage: None,
            system_fingerprint: None,
        })
    }

    /// Streams the upstream's raw byte body as line-buffered text deltas.
    /// There is no framing to parse and no per-line finish-reason — the
    /// only terminal signal a prompt-collapse upstream gives is the
    /// connection closing, so the final chunk is synthesized once the
    /// byte stream is exhausted.
    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<AdapterStream, AdapterError> {
        let model = self.map_model(&request.model);
        let wire = RawCompletionRequest {
            model: model.clone(),
            prompt: Self::collapse(&request),
            stream: true,
        };

        let response = race_cancel(
            self.http.post_json_raw("/api/generate", &wire),
            &cancellation,
        )
        .await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

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
                            let line = buffer[..line_end].to_string();
                            buffer = buffer[line_end + 1..].to_string();
                            if line.is_empty() {
                                continue;
                            }
                            yield Ok(StreamChunk {
                                id: uuid::Uuid::new_v4().to_string(),
                                object: "chat.completion.chunk".to_string(),
                                created: chrono::Utc::now().timestamp() as u64,
                                model: model.clone(),
                                choices: vec![StreamChoice {
                                    index: 0,
                                    delta: Delta {
                                        role: Some(Role::Assistant),
                                        content: Some(line),
                                        tool_calls: None,
                                    },
                                    finish_reason: None,
                                }],
                                usage: None,
                            });
                        }
                    }
                    Err(e) => yield Err(AdapterError::from(e)),
                }
            }

            if !buffer.is_empty() {
                yield Ok(StreamChunk {
                    id: uuid::Uuid::new_v4().to_string(),
                    object: "chat.completion.chunk".to_string(),
                    created: chrono::Utc::now().timestamp() as u64,
                    model: model.clone(),
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: Delta {
                            role: Some(Role::Assistant),
                            content: Some(buffer.clone()),
                            tool_calls: None,
                        },
                        finish_reason: None,
                    }],
                    usage: None,
                });
            }

            yield Ok(StreamChunk {
                id: uuid::Uuid::new_v4().to_string(),
                object: "chat.completion.chunk".to_string(),
                created: chrono::Utc::now().timestamp() as u64,
                model: model.clone(),
                choices: vec![StreamChoice {
                    index: 0,
                    delta: Delta::default(),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
            });
        });

        Ok(stream)
    }
}

#[derive(Serialize)]
struct RawCompletionRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(serde::Deserialize)]
struct RawCompletionResponse {
    response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_renders_one_line_per_message_in_order() {
        let request = ChatRequest {
            model: "llama2".to_string(),
            messages: vec![Message::system("be terse"), Message::user("hi there")],
            ..Default::default()
        };
        let prompt = PromptCollapseAdapter::collapse(&request);
        assert_eq!(prompt, "system: be terse\nuser: hi there\n");
    }
}
