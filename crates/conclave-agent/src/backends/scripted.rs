use super::LlmBackend;
use crate::llm::LlmResponse;
use async_trait::async_trait;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult};
use parking_lot::Mutex;
use std::collections::VecDeque;

type Responder = Box<dyn Fn(Option<&str>, &[BaseMessage]) -> ConclaveResult<String> + Send + Sync>;

/// One recorded call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// System prompt the caller passed.
    pub system_prompt: Option<String>,
    /// Conversation as sent.
    pub messages: Vec<BaseMessage>,
    /// Whether a JSON reply was requested.
    pub json_mode: bool,
}

/// Deterministic backend: replays queued replies, or computes them with a
/// responder function. Every call is recorded for inspection.
pub struct ScriptedBackend {
    queue: Mutex<VecDeque<ConclaveResult<String>>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    /// Replies with `replies` in order, then fails.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies with the given results in order (errors included), then fails.
    pub fn from_results(results: Vec<ConclaveResult<String>>) -> Self {
        Self {
            queue: Mutex::new(results.into()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Computes every reply from the prompt.
    pub fn responder<F>(f: F) -> Self
    where
        F: Fn(Option<&str>, &[BaseMessage]) -> ConclaveResult<String> + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Echo backend used by `provider = "mock"`.
    pub fn echo(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self::responder(move |_, messages| {
            let last = messages
                .iter()
                .rev()
                .find(|m| m.role == conclave_core::MessageRole::User)
                .map(|m| m.content.as_str())
                .unwrap_or("(nothing)");
            Ok(format!("[{model_id}] acknowledged: {last}"))
        })
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse> {
        self.calls.lock().push(RecordedCall {
            system_prompt: system_prompt.map(str::to_string),
            messages: messages.to_vec(),
            json_mode,
        });

        let queued = self.queue.lock().pop_front();
        let content = match (queued, &self.responder) {
            (Some(result), _) => result?,
            (None, Some(f)) => f(system_prompt, messages)?,
            (None, None) => {
                return Err(ConclaveError::Agent(
                    "ScriptedBackend: no more scripted responses".into(),
                ))
            }
        };
        let tokens_used = (content.len() / 4) as u64;
        Ok(LlmResponse {
            content,
            tokens_used,
        })
    }
}
