use super::LlmBackend;
use crate::config::{LlmProvider, ModelConfig};
use crate::llm::LlmResponse;
use async_trait::async_trait;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult, MessageRole};

/// Chat completions over the OpenAI wire format, shared by OpenAI, Groq,
/// OpenRouter and local servers that speak it. Message names travel in the
/// `name` field so the model can tell agents apart.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Backend for `config`. The API key must already be resolved.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
    ) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in messages {
            let mut entry = serde_json::json!({
                "role": m.role.to_string(),
                "content": m.content,
            });
            // OpenAI restricts `name` to [a-zA-Z0-9_-]
            if let Some(name) = &m.name {
                let clean: String = name
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                    .collect();
                if !clean.is_empty() && m.role != MessageRole::System {
                    entry["name"] = serde_json::json!(clean);
                }
            }
            api_messages.push(entry);
        }

        api_messages
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");

        if matches!(self.config.provider, LlmProvider::OpenRouter) {
            request.header("X-Title", "Conclave")
        } else {
            request
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let api_messages = self.build_messages(system_prompt, messages);

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": api_messages,
        });

        if json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let request = self.add_provider_headers(self.http.post(&url));

        let resp = request
            .json(&body)
            .send()
            .await
            .map_err(|e| ConclaveError::Http(e.to_string()))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ConclaveError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ConclaveError::Http(format!(
                "OpenAI API error {status}: {resp_body}"
            )));
        }

        parse_openai_response(&resp_body)
    }
}

/// Parse a non-streaming chat completions response.
pub fn parse_openai_response(body: &serde_json::Value) -> ConclaveResult<LlmResponse> {
    let message = &body["choices"][0]["message"];
    let content = message["content"]
        .as_str()
        .ok_or_else(|| ConclaveError::Agent(format!("Missing content in OpenAI response: {body}")))?
        .to_string();
    let tokens_used = body["usage"]["total_tokens"].as_u64().unwrap_or(0);
    Ok(LlmResponse {
        content,
        tokens_used,
    })
}
