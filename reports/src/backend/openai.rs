//! OpenAI-compatible LLM backend.
//!
//! Works with any API exposing `/chat/completions` and `/models`:
//! - OpenAI API
//! - Ollama
//! - self-hosted gateways configured as `custom`

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::*;

/// OpenAI-compatible backend.
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiBackend {
    /// Create a new OpenAI-compatible backend.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Result<Self, LlmError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| LlmError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.into(),
        })
    }

    /// Backend for the hosted OpenAI API.
    pub fn openai(model: &str, api_key: impl Into<String>) -> Result<Self, LlmError> {
        Self::new("https://api.openai.com/v1", model, Some(api_key.into()))
    }

    /// Backend for a local Ollama server.
    pub fn ollama(model: &str) -> Result<Self, LlmError> {
        Self::new("http://localhost:11434/v1", model, None)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn auth_header(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {}", k))
    }

    /// Call `GET /models`. Non-success statuses carry the API's own error
    /// message when the body has one.
    pub async fn list_models(&self) -> Result<(), LlmError> {
        let mut request = self.client.get(self.models_url());
        if let Some(auth) = self.auth_header() {
            request = request.header(header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        debug!(base_url = %self.base_url, "model listing succeeded");
        Ok(())
    }
}

/// OpenAI chat completion request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<UsageResponse>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// `{"error": {"message": "..."}}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// Extract the API's error message from a body, if it has one.
pub(crate) fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| "Unknown error".to_string())
}

async fn error_from_response(response: Response) -> LlmError {
    let status = response.status();
    let retry_after_ms = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000));
    let body = response.text().await.unwrap_or_default();

    if status.as_u16() == 429 {
        return LlmError::RateLimited { retry_after_ms };
    }

    let message = api_error_message(&body);
    warn!(status = status.as_u16(), message = %message, "LLM API returned an error");
    LlmError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        self.list_models().await.is_ok()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        for msg in &request.messages {
            messages.push(ChatMessage {
                role: msg.role.as_str(),
                content: &msg.content,
            });
        }

        let chat_request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let mut http_request = self.client.post(self.chat_completions_url());
        if let Some(auth) = self.auth_header() {
            http_request = http_request.header(header::AUTHORIZATION, auth);
        }

        let response = http_request
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ParseError("No choices in response".to_string()))?;

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        let usage = chat_response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        debug!(model = %self.model, tokens = usage.total(), "completion finished");

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_ollama_creation() {
        let backend = OpenAiBackend::ollama("llama3.2").unwrap();
        assert_eq!(backend.id(), "llama3.2");
        assert_eq!(backend.base_url(), "http://localhost:11434/v1");
    }

    #[test]
    fn test_api_error_message_fallback() {
        assert_eq!(
            api_error_message(r#"{"error": {"message": "Invalid key"}}"#),
            "Invalid key"
        );
        assert_eq!(api_error_message("<html>bad gateway</html>"), "Unknown error");
        assert_eq!(api_error_message(r#"{"error": {}}"#), "Unknown error");
    }

    #[tokio::test]
    async fn test_complete_sends_model_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "Analyze"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "<p>ok</p>"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(server.uri(), "gpt-4", Some("sk-test".into())).unwrap();
        let response = backend.complete(CompletionRequest::user("Analyze")).await.unwrap();

        assert_eq!(response.content, "<p>ok</p>");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total(), 13);
    }

    #[tokio::test]
    async fn test_complete_surfaces_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(server.uri(), "gpt-4", Some("bad".into())).unwrap();
        let err = backend.complete(CompletionRequest::user("hi")).await.unwrap_err();

        assert_eq!(
            err,
            LlmError::Api {
                status: 401,
                message: "Incorrect API key provided".into()
            }
        );
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(server.uri(), "gpt-4", None).unwrap();
        let err = backend.complete(CompletionRequest::user("hi")).await.unwrap_err();
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: Some(2000) });
    }

    #[tokio::test]
    async fn test_rate_limit_huge_retry_after_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", u64::MAX.to_string().as_str()))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(server.uri(), "gpt-4", None).unwrap();
        let err = backend.complete(CompletionRequest::user("hi")).await.unwrap_err();
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: Some(u64::MAX) });
    }

    #[tokio::test]
    async fn test_is_available_uses_models_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(format!("{}/", server.uri()), "gpt-4", None).unwrap();
        assert!(backend.is_available().await);
    }
}
