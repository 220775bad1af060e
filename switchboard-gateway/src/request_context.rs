//! Per-request correlation id and timing, attached to tracing spans
//! around a handler call. Carries only the tracing/timing fields the
//! ambient logging stack needs — no `user_id`/`api_key`, since auth is
//! an edge-layer concern this binary doesn't implement.

use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start_time: Instant,
    pub metadata: std::collections::HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            metadata: std::collections::HashMap::new(),
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&String> {
        self.metadata.get(key)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_unique_id_and_empty_metadata() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.request_id, b.request_id);
        assert!(a.get_metadata("missing").is_none());
    }

    #[test]
    fn metadata_round_trips() {
        let ctx = RequestContext::new().with_metadata("provider".to_string(), "openai".to_string());
        assert_eq!(ctx.get_metadata("provider"), Some(&"openai".to_string()));
    }
}
