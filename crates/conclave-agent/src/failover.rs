use crate::backends::LlmBackend;
use crate::llm::LlmResponse;
use async_trait::async_trait;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// `[model.retry_policy]`: how hard a model is retried before the next
/// fallback model is asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries per model after the first attempt.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Cap on a single backoff delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: the base doubled per attempt,
    /// never above `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = 2u64
            .checked_pow(attempt)
            .and_then(|factor| self.backoff_base_ms.checked_mul(factor))
            .map_or(self.backoff_max_ms, |ms| ms.min(self.backoff_max_ms));
        Duration::from_millis(ms)
    }
}

/// Whether `err` is worth another attempt against the same model.
///
/// Timeouts, dropped connections, 429 and 5xx are. Rejected requests
/// (400, 401, 403) and anything that is not a transport error are not.
pub fn is_retryable(err: &ConclaveError) -> bool {
    match err {
        ConclaveError::Timeout(_) => true,
        ConclaveError::Http(msg) => {
            let msg = msg.to_lowercase();
            let rejected = [" 400", " 401", " 403"];
            if rejected.iter().any(|code| msg.contains(code)) {
                return false;
            }
            ["429", "500", "502", "503", "504", "timeout", "timed out", "connection"]
                .iter()
                .any(|marker| msg.contains(marker))
        }
        _ => false,
    }
}

/// The primary model followed by its fallbacks, tried in order.
///
/// Returns the first successful reply, or the error of the last attempt
/// once every model is exhausted.
pub struct FailoverBackend {
    chain: Vec<Box<dyn LlmBackend>>,
    policy: RetryPolicy,
}

impl FailoverBackend {
    /// Fails with `ConclaveError::Config` when `chain` is empty.
    pub fn new(chain: Vec<Box<dyn LlmBackend>>, policy: RetryPolicy) -> ConclaveResult<Self> {
        if chain.is_empty() {
            return Err(ConclaveError::Config(
                "failover needs at least one model".into(),
            ));
        }
        Ok(Self { chain, policy })
    }

    /// Retry policy applied to every model in the chain.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn ask(
        &self,
        position: usize,
        backend: &dyn LlmBackend,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse> {
        let mut attempt = 0;
        loop {
            let err = match backend.chat(system_prompt, messages, json_mode).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };
            if !is_retryable(&err) || attempt >= self.policy.max_retries {
                warn!(model = position, attempt, error = %err, "Model gave up");
                return Err(err);
            }
            let delay = self.policy.backoff(attempt);
            info!(
                model = position,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Transient model error, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl LlmBackend for FailoverBackend {
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[BaseMessage],
        json_mode: bool,
    ) -> ConclaveResult<LlmResponse> {
        let mut last = None;
        for (position, backend) in self.chain.iter().enumerate() {
            match self
                .ask(position, backend.as_ref(), system_prompt, messages, json_mode)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| ConclaveError::Agent("no model answered".into())))
    }
}
