use crate::failover::RetryPolicy;
use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};

/// Which API a model is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Messages API.
    Claude,
    /// OpenAI Chat Completions API.
    OpenAi,
    /// OpenRouter, OpenAI-compatible API.
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible API.
    Groq,
    /// Offline echo backend for dry runs; never leaves the process.
    Mock,
}

/// One model: provider, id, credentials and sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// API the model is served by.
    pub provider: LlmProvider,
    /// Provider-side model name, e.g. `gpt-4o`.
    pub model_id: String,
    /// Literal key, or `env:VAR_NAME` to read it from the environment.
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's default endpoint.
    pub api_base_url: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Reply length limit in tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// How many times a structured reply that fails to parse is re-requested.
    #[serde(default = "default_structured_retries")]
    pub max_structured_retries: u32,
    /// Models tried in order when this one keeps failing.
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    /// Retries per model. Without it, and without fallbacks, there is no failover.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_structured_retries() -> u32 {
    2
}

impl ModelConfig {
    /// Config for the offline [`LlmProvider::Mock`] backend.
    pub fn mock(model_id: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::Mock,
            model_id: model_id.into(),
            api_key: String::new(),
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_structured_retries: default_structured_retries(),
            fallback_models: Vec::new(),
            retry_policy: None,
        }
    }

    /// Endpoint root: `api_base_url`, or the provider default.
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::Claude => "https://api.anthropic.com",
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::OpenRouter => "https://openrouter.ai/api",
                LlmProvider::Groq => "https://api.groq.com/openai",
                LlmProvider::Mock => "local://mock",
            }
        }
    }

    /// Replaces `env:VAR` api keys (here and in fallbacks) with the variable's value.
    pub fn resolve_api_key(mut self) -> ConclaveResult<Self> {
        if let Some(var) = self.api_key.strip_prefix("env:").map(str::to_string) {
            self.api_key = std::env::var(&var).map_err(|_| {
                ConclaveError::Config(format!(
                    "api key variable '{var}' for model '{}' is not set",
                    self.model_id
                ))
            })?;
        }
        self.fallback_models = self
            .fallback_models
            .into_iter()
            .map(ModelConfig::resolve_api_key)
            .collect::<ConclaveResult<_>>()?;
        Ok(self)
    }
}
