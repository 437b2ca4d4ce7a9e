use super::LlmBackend;
use crate::config::ModelConfig;
use crate::llm::LlmResponse;
use async_trait::async_trait;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult, MessageRole};
use serde::Serialize;

/// Anthropic Messages API.
pub struct ClaudeBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl ClaudeBackend {
    /// Backend for `config`. The API key must already be resolved.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: String,
}

/// Claude has no per-message speaker names and requires alternating roles,
/// so speakers are inlined and consecutive same-role turns are merged.
fn build_messages(messages: &[BaseMessage]) -> Vec<ClaudeMessage> {
    let mut out: Vec<ClaudeMessage> = Vec::new();
    for m in messages {
        let role = match m.role {
            MessageRole::System => continue,
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        let content = match &m.name {
            Some(name) => format!("{name}: {}", m.content),
            None => m.content.clone(),
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&content);
            }
            _ => out.push(ClaudeMessage { role, content }),
        }
    }
    out
}

#[async_trait]
impl LlmBackend for ClaudeBackend {
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse> {
        let url = format!("{}/v1/messages", self.config.base_url());

        let mut system = system_prompt.map(str::to_string);
        // System messages inside the history are folded into the system prompt
        for m in messages.iter().filter(|m| m.role == MessageRole::System) {
            let s = system.get_or_insert_with(String::new);
            if !s.is_empty() {
                s.push_str("\n\n");
            }
            s.push_str(&m.content);
        }
        if json_mode {
            let s = system.get_or_insert_with(String::new);
            s.push_str("\n\nRespond with a single JSON value and nothing else.");
        }

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": build_messages(messages),
        });

        if let Some(sys) = system {
            body["system"] = serde_json::json!(sys);
        }

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
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
                "Claude API error {status}: {resp_body}"
            )));
        }

        parse_claude_response(&resp_body)
    }
}

/// Extracts the text blocks and token usage of a Messages API reply.
pub fn parse_claude_response(body: &serde_json::Value) -> ConclaveResult<LlmResponse> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ConclaveError::Agent("Missing content in Claude response".into()))?;

    let text = content
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let usage = &body["usage"];
    let tokens_used = usage["input_tokens"].as_u64().unwrap_or(0)
        + usage["output_tokens"].as_u64().unwrap_or(0);

    Ok(LlmResponse {
        content: text,
        tokens_used,
    })
}
