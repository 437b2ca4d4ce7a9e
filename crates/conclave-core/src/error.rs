use thiserror::Error;

/// A convenience `Result` alias using [`ConclaveError`].
pub type ConclaveResult<T> = Result<T, ConclaveError>;

/// Top-level error type for the Conclave framework.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// An error originating from an agent run.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from an outbound HTTP request (LLM API call, remote bus peer).
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error publishing, routing or decoding bus messages.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error reading or writing a state store.
    #[error("State error: {0}")]
    State(String),

    /// An error looking up or updating the agent registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// A plan violated one of its structural invariants.
    #[error("Plan error: {0}")]
    Plan(String),

    /// An error from the orchestration loop.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Whether this error came from a state store etag conflict.
    pub fn is_etag_mismatch(&self) -> bool {
        matches!(self, ConclaveError::State(msg) if msg.contains("etag mismatch"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConclaveError::Plan("unknown step 7".into());
        assert_eq!(err.to_string(), "Plan error: unknown step 7");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: ConclaveError = parse.unwrap_err().into();
        assert!(matches!(err, ConclaveError::Json(_)));
    }

    #[test]
    fn test_etag_mismatch_detection() {
        assert!(ConclaveError::State("etag mismatch for key 'a'".into()).is_etag_mismatch());
        assert!(!ConclaveError::State("disk full".into()).is_etag_mismatch());
        assert!(!ConclaveError::Bus("etag mismatch".into()).is_etag_mismatch());
    }
}
