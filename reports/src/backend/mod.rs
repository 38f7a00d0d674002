//! LLM backend abstraction layer.
//!
//! - OpenAI-compatible HTTP (OpenAI, Ollama, custom gateways)
//! - Mock backend for testing

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use traits::{CompletionRequest, CompletionResponse, FinishReason, LlmBackend, LlmError, Message, MessageRole, Usage};
