//! Mock LLM backend for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::traits::*;

/// Mock backend with a canned response. Records the last request so tests
/// can inspect the prompt that was built.
pub struct MockBackend {
    model_id: String,
    available: AtomicBool,
    response_content: String,
    failure: Option<LlmError>,
    call_count: AtomicU32,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            available: AtomicBool::new(true),
            response_content: "Mock response".to_string(),
            failure: None,
            call_count: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Set the response content.
    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response_content = content.into();
        self
    }

    /// Set availability.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Fail every completion with `error`.
    pub fn with_failure(mut self, error: LlmError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Number of times `complete` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn id(&self) -> &str {
        &self.model_id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("Mock backend disabled".to_string()));
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        // Rough token estimate
        let prompt_tokens: u32 = request.messages.iter().map(|m| m.content.len() as u32 / 4).sum();
        let completion_tokens = self.response_content.len() as u32 / 4;

        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner) = Some(request);

        Ok(CompletionResponse {
            content: self.response_content.clone(),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend() {
        let backend = MockBackend::new("test-model").with_response("<p>Looks healthy</p>");

        assert!(backend.is_available().await);
        assert_eq!(backend.call_count(), 0);

        let response = backend.complete(CompletionRequest::user("Hi")).await.unwrap();

        assert_eq!(response.content, "<p>Looks healthy</p>");
        assert_eq!(backend.call_count(), 1);
        assert_eq!(backend.last_request().unwrap().user_text(), "Hi");
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let backend = MockBackend::new("test-model").with_available(false);

        assert!(!backend.is_available().await);
        assert!(backend.complete(CompletionRequest::user("Hi")).await.is_err());
        assert!(backend.last_request().is_none());
    }
}
