//! Adapter for Cohere's `/v2/chat` wire format.
//!
//! Distinguishing quirk: streaming uses named SSE events
//! (`event: content-delta`, `event: message-end`) rather than a single
//! `data:` line carrying the whole chunk. The request body itself maps
//! role-for-role into a flat `messages` array, same shape as the
//! OpenAI-shaped adapter's turns, since v2 dropped v1's `message` +
//! `chat_history` split. No other adapter shares the named-event
//! streaming shape, so the conversion helpers below are original,
//! following the same to-wire/from-wire split the google-shaped adapter
//! uses.

use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};

use super::http_client::{map_error_response, race_cancel, AuthStrategy, HttpProviderClient};
use super::{Adapter, AdapterConfig, AdapterStream};

pub struct CohereShapedAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

impl CohereShapedAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.cohere.com",
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

    fn to_wire(&self, request: &ChatRequest) -> CohereRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| CohereMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                }
                .to_string(),
                content: m.content.clone(),
            })
            .collect();

        CohereRequest {
            model: self.map_model(&request.model),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: request.stream.unwrap_or(false),
        }
    }
}

#[async_trait::async_trait]
impl Adapter for CohereShapedAdapter {
    fn family(&self) -> &'static str {
        "cohere-shaped"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let mut wire = self.to_wire(&request);
        wire.stream = false;
        let response: CohereResponse =
            race_cancel(self.http.post_json("/v2/chat", &wire), &cancellation).await?;

        Ok(ChatResponse {
            id: response.generation_id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: wire.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(response.text),
                finish_reason: response.finish_reason,
                logprobs: None,
            }],
            usage: response.meta.and_then(|m| m.billed_units).map(|u| Usage {
                prompt_tokens: u.input_tokens.unwrap_or(0),
                completion_tokens: u.output_tokens.unwrap_or(0),
                total_tokens: u.input_tokens.unwrap_or(0) + u.output_tokens.unwrap_or(0),
                estimated: false,
            }),
            system_fingerprint: None,
        })
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<AdapterStream, AdapterError> {
        let mut wire = self.to_wire(&request);
        wire.stream = true;
        let model = wire.model.clone();

        let response = race_cancel(self.http.post_json_raw("/v2/chat", &wire), &cancellation).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut current_event: Option<String> = None;

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
                            let line = buffer[..line_end].trim_end().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            if let Some(event) = line.strip_prefix("event: ") {
                                current_event = Some(event.trim().to_string());
                                continue;
                            }
                            let Some(data) = line.strip_prefix("data: ") else { continue };

                            match current_event.as_deref() {
                                Some("content-delta") => {
                                    if let Ok(event) = serde_json::from_str::<CohereContentDelta>(data) {
                                        yield Ok(StreamChunk {
                                            id: uuid::Uuid::new_v4().to_string(),
                                            object: "chat.completion.chunk".to_string(),
                                            created: chrono::Utc::now().timestamp() as u64,
                                            model: model.clone(),
                                            choices: vec![StreamChoice {
                                                index: 0,
                                                delta: Delta {
                                                    role: Some(Role::Assistant),
                                                    content: Some(event.delta.message.content.text),
                                                    tool_calls: None,
                                                },
                                                finish_reason: None,
                                            }],
                                            usage: None,
                                        });
                                    }
                                }
                                Some("message-end") => {
                                    if let Ok(event) = serde_json::from_str::<CohereMessageEnd>(data) {
                                        let usage = event.delta.usage.billed_units.map(|u| Usage {
                                            prompt_tokens: u.input_tokens.unwrap_or(0),
                                            completion_tokens: u.output_tokens.unwrap_or(0),
                                            total_tokens: u.input_tokens.unwrap_or(0) + u.output_tokens.unwrap_or(0),
                                            estimated: false,
                                        });
                                        yield Ok(StreamChunk {
                                            id: uuid::Uuid::new_v4().to_string(),
                                            object: "chat.completion.chunk".to_string(),
                                            created: chrono::Utc::now().timestamp() as u64,
                                            model: model.clone(),
                                            choices: vec![StreamChoice {
                                                index: 0,
                                                delta: Delta::default(),
                                                finish_reason: Some(event.delta.finish_reason),
                                            }],
                                            usage,
                                        });
                                    }
                                }
                                _ => {}
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
struct CohereRequest {
    model: String,
    messages: Vec<CohereMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct CohereMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct CohereResponse {
    generation_id: String,
    text: String,
    finish_reason: Option<String>,
    meta: Option<CohereMeta>,
}

#[derive(Deserialize)]
struct CohereMeta {
    billed_units: Option<CohereBilledUnits>,
}

#[derive(Deserialize)]
struct CohereBilledUnits {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CohereContentDelta {
    delta: CohereContentDeltaInner,
}

#[derive(Deserialize)]
struct CohereContentDeltaInner {
    message: CohereDeltaMessage,
}

#[derive(Deserialize)]
struct CohereDeltaMessage {
    content: CohereDeltaContent,
}

#[derive(Deserialize)]
struct CohereDeltaContent {
    text: String,
}

#[derive(Deserialize)]
struct CohereMessageEnd {
    delta: CohereMessageEndDelta,
}

#[derive(Deserialize)]
struct CohereMessageEndDelta {
    finish_reason: String,
    usage: CohereUsageWrapper,
}

#[derive(Deserialize)]
struct CohereUsageWrapper {
    billed_units: Option<CohereBilledUnits>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CohereShapedAdapter {
        CohereShapedAdapter::new(AdapterConfig::new("cohere-shaped", "key")).unwrap()
    }

    #[test]
    fn messages_map_role_for_role_in_order() {
        let request = ChatRequest {
            model: "command-r".to_string(),
            messages: vec![Message::user("first"), Message::assistant("reply"), Message::user("second")],
            ..Default::default()
        };
        let wire = adapter().to_wire(&request);
        assert_eq!(wire.messages.len(), 3);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.messages[0].content, "first");
        assert_eq!(wire.messages[1].role, "assistant");
        assert_eq!(wire.messages[2].role, "user");
        assert_eq!(wire.messages[2].content, "second");
    }

    #[test]
    fn system_message_keeps_its_own_role() {
        let request = ChatRequest {
            model: "command-r".to_string(),
            messages: vec![Message::system("be terse"), Message::user("hi")],
            ..Default::default()
        };
        let wire = adapter().to_wire(&request);
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[1].role, "user");
    }

    #[tokio::test]
    async fn chat_completion_posts_a_v2_shaped_messages_array() {
        use wiremock::matchers::{body_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let expected_body = serde_json::json!({
            "model": "command-r",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
            "stream": false,
        });
        Mock::given(method("POST"))
            .and(path("/v2/chat"))
            .and(body_json(expected_body))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "generation_id": "gen-1",
                "text": "terse reply",
                "finish_reason": "COMPLETE",
                "meta": {"billed_units": {"input_tokens": 4, "output_tokens": 2}}
            })))
            .mount(&server)
            .await;

        let config = AdapterConfig::new("cohere-shaped", "key").with_base_url(server.uri());
        let adapter = CohereShapedAdapter::new(config).unwrap();
        let request = ChatRequest {
            model: "command-r".to_string(),
            messages: vec![Message::system("be terse"), Message::user("hi")],
            ..Default::default()
        };
        let response = adapter
            .chat_completion(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.choices[0].message.content, "terse reply");
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 2);
    }
}
