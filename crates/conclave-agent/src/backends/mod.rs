/// Anthropic Messages API.
pub mod claude;
/// OpenAI-compatible chat completions.
pub mod openai;
/// Deterministic replies for tests and dry runs.
pub mod scripted;

use crate::llm::LlmResponse;
use async_trait::async_trait;
use conclave_core::{BaseMessage, ConclaveResult};

pub use scripted::ScriptedBackend;

/// One model provider. [`crate::LlmClient`] picks the implementation from
/// `ModelConfig::provider`.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Non-streaming chat completion.
    ///
    /// `json_mode` asks providers that support it to constrain the reply to a
    /// single JSON value.
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse>;
}

#[async_trait]
impl<B: LlmBackend + ?Sized> LlmBackend for std::sync::Arc<B> {
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse> {
        (**self).chat(system_prompt, messages, json_mode).await
    }
}
