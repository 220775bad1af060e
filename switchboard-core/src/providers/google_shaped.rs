//! Adapter for Google's Gemini `generateContent` wire format.
//!
//! Not a close match to any single canonical representation: system
//! messages hoist into a dedicated `systemInstruction` field rather than
//! living in the `contents` array, streaming uses `?alt=sse` plus a
//! response body wrapped one level deeper (`{"response": {"candidates":
//! [...]}}` per event) instead of the OpenAI-style bare chunk, and there
//! is no `[DONE]` sentinel — the stream just ends. The conversion
//! helpers go through the canonical [`crate::models`] types rather than
//! a hand-rolled partial `ChatResponse`.

use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};

use super::http_client::{map_error_response, race_cancel, HttpProviderClient};
use super::{Adapter, AdapterConfig, AdapterStream};

pub struct GoogleShapedAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

impl GoogleShapedAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://generativelanguage.googleapis.com/v1beta",
            &config.headers,
            super::http_client::AuthStrategy::Header {
                name: "x-goog-api-key".to_string(),
                value: config.api_key.clone(),
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

    fn to_wire(&self, request: &ChatRequest) -> GeminiRequest {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => {
                    system_instruction = Some(GeminiContent {
                        role: "system".to_string(),
                        parts: vec![GeminiPart {
                            text: message.content.clone(),
                        }],
                    });
                }
                Role::User | Role::Tool => contents.push(GeminiContent {
                    role: "user".to_string(),
                    parts: vec![GeminiPart {
                        text: message.content.clone(),
                    }],
                }),
                Role::Assistant => contents.push(GeminiContent {
                    role: "model".to_string(),
                    parts: vec![GeminiPart {
                        text: message.content.clone(),
                    }],
                }),
            }
        }

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens.map(|t| t as i32),
                top_p: request.top_p,
            }),
        }
    }

    fn from_wire(&self, model: &str, response: GeminiResponse) -> ChatResponse {
        let choices = response
            .candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                let content = candidate
                    .content
                    .parts
                    .iter()
                    .map(|part| part.text.clone())
                    .collect::<Vec<_>>()
                    .join("");
                Choice {
                    index: index as u32,
                    message: Message::assistant(content),
                    finish_reason: candidate.finish_reason.clone(),
                    logprobs: None,
                }
            })
            .collect();

        let usage = response.usage_metadata.map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
            estimated: false,
        });

        ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.to_string(),
            choices,
            usage,
            system_fingerprint: None,
        }
    }
}

#[async_trait::async_trait]
impl Adapter for GoogleShapedAdapter {
    fn family(&self) -> &'static str {
        "google-shaped"
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
        let wire = self.to_wire(&request);
        let path = format!("/models/{model}:generateContent");
        let response: GeminiResponse =
            race_cancel(self.http.post_json(&path, &wire), &cancellation).await?;
        Ok(self.from_wire(&model, response))
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<AdapterStream, AdapterError> {
        let model = self.map_model(&request.model);
        let wire = self.to_wire(&request);
        let path = format!("/models/{model}:streamGenerateContent?alt=sse");

        let response = race_cancel(self.http.post_json_raw(&path, &wire), &cancellation).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let stream_model = model.clone();
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

                            let Some(json_str) = line.strip_prefix("data: ") else { continue };
                            if json_str.is_empty() {
                                continue;
                            }

                            // Malformed JSON in a stream frame is dropped, not fatal.
                            if let Ok(envelope) = serde_json::from_str::<GeminiStreamEnvelope>(json_str) {
                                for candidate in envelope.response.candidates {
                                    let text = candidate
                                        .content
                                        .parts
                                        .iter()
                                        .map(|p| p.text.clone())
                                        .collect::<Vec<_>>()
                                        .join("");
                                    yield Ok(StreamChunk {
                                        id: uuid::Uuid::new_v4().to_string(),
                                        object: "chat.completion.chunk".to_string(),
                                        created: chrono::Utc::now().timestamp() as u64,
                                        model: stream_model.clone(),
                                        choices: vec![StreamChoice {
                                            index: 0,
                                            delta: Delta {
                                                role: Some(Role::Assistant),
                                                content: Some(text),
                                                tool_calls: None,
                                            },
                                            finish_reason: candidate.finish_reason.clone(),
                                        }],
                                        usage: None,
                                    });
                                }
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
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: Option<f32>,
    max_output_tokens: Option<i32>,
    top_p: Option<f32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: u32,
    candidates_token_count: u32,
    total_token_count: u32,
}

/// Each SSE event's payload wraps the candidate list one level deeper
/// than the unary response.
#[derive(Deserialize)]
struct GeminiStreamEnvelope {
    response: GeminiStreamResponse,
}

#[derive(Deserialize)]
struct GeminiStreamResponse {
    candidates: Vec<GeminiCandidate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn adapter() -> GoogleShapedAdapter {
        GoogleShapedAdapter::new(AdapterConfig::new("google-shaped", "key")).unwrap()
    }

    #[test]
    fn system_message_hoists_out_of_contents() {
        let request = ChatRequest {
            model: "gemini-1.5-flash".to_string(),
            messages: vec![Message::system("be terse"), Message::user("hi")],
            ..Default::default()
        };
        let wire = adapter().to_wire(&request);
        assert!(wire.system_instruction.is_some());
        assert_eq!(wire.contents.len(), 1);
        assert_eq!(wire.contents[0].role, "user");
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let request = ChatRequest {
            model: "gemini-1.5-flash".to_string(),
            messages: vec![Message::assistant("prior reply")],
            ..Default::default()
        };
        let wire = adapter().to_wire(&request);
        assert_eq!(wire.contents[0].role, "model");
    }
}
