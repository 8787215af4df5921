//! Typed error hierarchy for appgen.
//!
//! One enum per subsystem:
//! - `LlmError`: chat-completion provider failures
//! - `ValidationError`: failures running external validators (not failed checks)
//! - `PipelineError`: state machine and stage actor failures
//! - `ToolError`: FSM tool dispatch failures

use thiserror::Error;

use crate::pipeline::{FsmState, Stage};

/// Errors from the chat-completion layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: set {env_var} or [llm].api_key in appgen.toml")]
    MissingApiKey { env_var: &'static str },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider response could not be decoded: {0}")]
    Decode(String),

    #[error("Scripted LLM ran out of responses after {served} completions")]
    ScriptExhausted { served: usize },
}

impl LlmError {
    /// Whether the request is worth retrying (rate limits and server errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Errors raised while running a validator. A check that runs and reports
/// errors is not a `ValidationError`; it is a failed `CompileResult`.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Failed to prepare workspace at {path}: {source}")]
    Workspace {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn validator `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Validator `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("No command configured for {check}")]
    NotConfigured { check: &'static str },
}

/// Errors from the stage pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Event `{event}` is not accepted in state `{state}`")]
    InvalidEvent { state: FsmState, event: String },

    #[error("Stage {stage} requires {missing}, which has not been generated")]
    MissingInput { stage: Stage, missing: &'static str },

    #[error("Stage {stage} has no component `{component}` (known: {known})")]
    UnknownComponent {
        stage: Stage,
        component: String,
        known: String,
    },

    #[error("Stage {stage} found no valid candidate after {rounds} rounds: {last_error}")]
    SearchExhausted {
        stage: Stage,
        rounds: usize,
        last_error: String,
    },

    #[error("Failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors from FSM tool dispatch.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool `{0}`")]
    UnknownTool(String),

    #[error("Invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_error_retryable_on_rate_limit_and_server_errors() {
        let rate_limited = LlmError::Status {
            status: 429,
            body: "slow down".into(),
        };
        let overloaded = LlmError::Status {
            status: 529,
            body: "overloaded".into(),
        };
        let bad_request = LlmError::Status {
            status: 400,
            body: "bad".into(),
        };
        assert!(rate_limited.is_retryable());
        assert!(overloaded.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!LlmError::ScriptExhausted { served: 2 }.is_retryable());
    }

    #[test]
    fn pipeline_error_invalid_event_names_state_and_event() {
        let err = PipelineError::InvalidEvent {
            state: FsmState::Complete,
            event: "confirm".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("complete"));
        assert!(msg.contains("confirm"));
    }

    #[test]
    fn pipeline_error_wraps_llm_error() {
        let err: PipelineError = LlmError::MissingApiKey {
            env_var: "ANTHROPIC_API_KEY",
        }
        .into();
        match err {
            PipelineError::Llm(LlmError::MissingApiKey { env_var }) => {
                assert_eq!(env_var, "ANTHROPIC_API_KEY");
            }
            other => panic!("Expected Llm variant, got {other:?}"),
        }
    }

    #[test]
    fn validation_error_timeout_carries_command() {
        let err = ValidationError::Timeout {
            command: "npx tsc --noEmit".into(),
            secs: 30,
        };
        assert!(err.to_string().contains("npx tsc --noEmit"));
        assert!(err.to_string().contains("30s"));
    }
}
