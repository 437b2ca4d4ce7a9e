use crate::backends::claude::ClaudeBackend;
use crate::backends::openai::OpenAiBackend;
use crate::backends::{LlmBackend, ScriptedBackend};
use crate::config::{LlmProvider, ModelConfig};
use crate::failover::FailoverBackend;
use crate::structured::parse_structured;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A completed model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    /// Text of the reply.
    pub content: String,
    /// Tokens billed for the call, when the provider reports them.
    pub tokens_used: u64,
}

/// LLM client that dispatches to the correct provider backend.
///
/// Uses the `LlmBackend` trait to abstract away provider-specific API differences.
pub struct LlmClient {
    backend: Box<dyn LlmBackend>,
    max_structured_retries: u32,
}

fn backend_for(config: ModelConfig) -> Box<dyn LlmBackend> {
    match config.provider {
        LlmProvider::Claude => Box::new(ClaudeBackend::new(config)),
        LlmProvider::OpenAi | LlmProvider::OpenRouter | LlmProvider::Groq => {
            Box::new(OpenAiBackend::new(config))
        }
        LlmProvider::Mock => Box::new(ScriptedBackend::echo(config.model_id)),
    }
}

impl LlmClient {
    /// Builds the backend for `config`, wrapped in failover when a retry
    /// policy or fallback models are configured.
    pub fn new(config: ModelConfig) -> ConclaveResult<Self> {
        let max_structured_retries = config.max_structured_retries;
        let backend: Box<dyn LlmBackend> =
            if config.retry_policy.is_some() || !config.fallback_models.is_empty() {
                let policy = config.retry_policy.clone().unwrap_or_default();
                let mut chain = config.fallback_models.clone();
                chain.insert(0, config);
                let backends = chain.into_iter().map(backend_for).collect();
                Box::new(FailoverBackend::new(backends, policy)?)
            } else {
                backend_for(config)
            };
        Ok(Self {
            backend,
            max_structured_retries,
        })
    }

    /// Create from a pre-built backend (for custom/external providers and tests).
    pub fn from_backend(backend: Box<dyn LlmBackend>) -> Self {
        Self {
            backend,
            max_structured_retries: 2,
        }
    }

    /// Overrides how often unparseable structured replies are re-requested.
    pub fn with_structured_retries(mut self, retries: u32) -> Self {
        self.max_structured_retries = retries;
        self
    }

    /// Plain chat completion.
    pub async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
    ) -> ConclaveResult<LlmResponse> {
        self.backend.chat(system_prompt, messages, false).await
    }

    /// Chat completion whose reply must deserialize into `T`.
    ///
    /// The JSON schema is appended to the last message. A reply that does not
    /// parse is fed back to the model with the parse error, up to
    /// `max_structured_retries` times.
    pub async fn chat_structured<T: DeserializeOwned>(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        schema: &serde_json::Value,
    ) -> ConclaveResult<(T, LlmResponse)> {
        let mut conversation = messages.to_vec();
        conversation.push(BaseMessage::user(format!(
            "Respond ONLY with JSON matching this schema:\n{schema}"
        )));

        let mut last_err = None;
        for attempt in 0..=self.max_structured_retries {
            let response = self.backend.chat(system_prompt, &conversation, true).await?;
            match parse_structured::<T>(&response.content) {
                Ok(value) => {
                    debug!(attempt, "Structured reply parsed");
                    return Ok((value, response));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Structured reply did not parse");
                    conversation.push(BaseMessage::assistant(response.content));
                    conversation.push(BaseMessage::user(format!(
                        "Your previous reply could not be used: {e}. \
                         Reply again with valid JSON matching the schema."
                    )));
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ConclaveError::Agent("structured reply failed without attempts".into())
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pick {
        agent: String,
    }

    #[tokio::test]
    async fn test_structured_retries_with_feedback() {
        let scripted = Arc::new(ScriptedBackend::new([
            "I think Gandalf should go.",
            "```json\n{\"agent\": \"Gandalf\"}\n```",
        ]));
        let client = LlmClient::from_backend(Box::new(scripted.clone()));

        let (pick, _) = client
            .chat_structured::<Pick>(None, &[BaseMessage::user("who?")], &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(pick.agent, "Gandalf");

        let calls = scripted.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].json_mode);
        let retry_prompt = &calls[1].messages.last().unwrap().content;
        assert!(retry_prompt.contains("could not be used"));
    }

    #[tokio::test]
    async fn test_structured_gives_up() {
        let client = LlmClient::from_backend(Box::new(ScriptedBackend::new(["no", "still no"])))
            .with_structured_retries(1);
        let err = client
            .chat_structured::<Pick>(None, &[], &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Agent(_)));
    }

    #[tokio::test]
    async fn test_mock_provider_echoes() {
        let client = LlmClient::new(ModelConfig::mock("dry-run")).unwrap();
        let resp = client.chat(None, &[BaseMessage::user("hello")]).await.unwrap();
        assert_eq!(resp.content, "[dry-run] acknowledged: hello");
    }
}
