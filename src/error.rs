//! Error types for the agent runtime
//!
//! Collaborator failures (LLM, embeddings, summarizer, persistence, scheduler)
//! surface here at the trait boundary. Capacity and validation outcomes such as
//! a full mailbox or an exhausted absorption quota are reported as values, not
//! as errors.

use thiserror::Error;

/// Main error type for runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Language model call failed
    #[error("LLM error: {0}")]
    Llm(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Summarization failed
    #[error("Summarizer error: {0}")]
    Summarizer(String),

    /// Persisting a record failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Scheduler rejected a registration or binding
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Tool call payload failed validation at the boundary
    #[error("Invalid tool call: {0}")]
    InvalidToolCall(String),

    /// Memory not found
    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    /// Agent not found in session
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Invalid operation (e.g. starting a loop twice)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Convert anyhow::Error to RuntimeError
impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        RuntimeError::Other(err.to_string())
    }
}
