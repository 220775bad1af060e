//! Adapter for upstreams that speak the OpenAI chat-completions wire
//! format verbatim: request/response bodies already match
//! [`crate::models::ChatRequest`]/[`ChatResponse`], and streaming is
//! `data: {...}\n\n` SSE terminated by `data: [DONE]`.
//!
//! No format translation is needed at all beyond base URL and auth. Any
//! vendor whose API is OpenAI-compatible (Groq, Mistral, OpenRouter,
//! Perplexity, Azure OpenAI, self-hosted Ollama-with-OpenAI-shim) is
//! reached through this one adapter, distinguished only by
//! [`super::AdapterConfig`].

use async_stream::stream;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};

use super::http_client::{map_error_response, race_cancel, AuthStrategy, HttpProviderClient};
use super::{Adapter, AdapterConfig, AdapterStream};

pub struct OpenAiShapedAdapter {
    http: HttpProviderClient,
    config: AdapterConfig,
}

impl OpenAiShapedAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.openai.com/v1",
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
}

#[async_trait::async_trait]
impl Adapter for OpenAiShapedAdapter {
    fn family(&self) -> &'static str {
        "openai-shaped"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_completion(
        &self,
        mut request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        request.model = self.map_model(&request.model);
        request.stream = None;
        race_cancel(self.http.post_json("/chat/completions", &request), &cancellation).await
    }

    async fn stream_chat_completion(
        &self,
        mut request: ChatRequest,
        cancellation: CancellationToken,
    ) -> Result<AdapterStream, AdapterError> {
        request.model = self.map_model(&request.model);
        request.stream = Some(true);

        let response = race_cancel(
            self.http.post_json_raw("/chat/completions", &request),
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
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            let Some(json_str) = line.strip_prefix("data: ") else { continue };
                            if json_str == "[DONE]" {
                                return;
                            }
                            // Malformed JSON in a stream frame is dropped, not fatal.
                            if let Ok(stream_chunk) = serde_json::from_str::<StreamChunk>(json_str) {
                                yield Ok(stream_chunk);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_mapping_rewrites_known_aliases() {
        let config = AdapterConfig::new("openai-shaped", "key")
            .with_model_mapping("gpt-4o", "llama3-70b-8192");
        let adapter = OpenAiShapedAdapter::new(config).unwrap();
        assert_eq!(adapter.map_model("gpt-4o"), "llama3-70b-8192");
        assert_eq!(adapter.map_model("untouched"), "untouched");
    }

    #[tokio::test]
    async fn chat_completion_round_trips_through_http() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 0,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hi there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            })))
            .mount(&server)
            .await;

        let config = AdapterConfig::new("openai-shaped", "key").with_base_url(server.uri());
        let adapter = OpenAiShapedAdapter::new(config).unwrap();
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![crate::models::Message::user("hello")],
            ..Default::default()
        };
        let response = adapter
            .chat_completion(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.choices[0].message.content, "hi there");
        assert_eq!(response.usage.unwrap().prompt_tokens, 10);
    }

    #[tokio::test]
    async fn upstream_server_error_is_classified_not_panicked() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": {"message": "overloaded"}
            })))
            .mount(&server)
            .await;

        let config = AdapterConfig::new("openai-shaped", "key").with_base_url(server.uri());
        let adapter = OpenAiShapedAdapter::new(config).unwrap();
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            ..Default::default()
        };
        let error = adapter
            .chat_completion(request, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AdapterError::UpstreamServerError { status: 503, .. }));
    }
}
