//! Crate-wide error type for the agent runtime.

use thiserror::Error;

/// Errors surfaced across the completion client, tool executor and agent loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("path '{0}' escapes the workspace root")]
    WorkspaceViolation(String),

    #[error("sandbox denied: {0}")]
    SandboxDenied(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("agent loop exhausted after {0} rounds without a final answer")]
    LoopExhausted(usize),

    #[error("{0} is unavailable")]
    Unavailable(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Provider(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
