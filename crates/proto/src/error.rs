use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// LLM provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool registration/execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Conversation store error.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),

    /// The agent loop hit its configured iteration cap.
    #[error("Iteration limit reached after {0} tool rounds")]
    IterationLimit(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM provider errors
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Missing or invalid credentials/model. Never retried.
    #[error("Provider not configured: {0}")]
    Config(String),

    /// Network-level failure before a response arrived.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote API answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider refused the request without exposing an HTTP status.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Provider response body or stream was malformed.
    #[error("Invalid response from LLM: {0}")]
    Protocol(String),

    /// Request serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LlmError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(_) | LlmError::RateLimit => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Config(_)
            | LlmError::Rejected(_)
            | LlmError::Protocol(_)
            | LlmError::Serialization(_) => false,
        }
    }
}

/// Tool execution errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Requested tool is unknown.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Tool process or operation failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Tool exceeded allowed execution time.
    #[error("Timeout after {0}s")]
    Timeout(u64),

    /// Tool call arguments are invalid.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// Filesystem/process IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Schema setup error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid autonomy level string value.
    #[error("Invalid autonomy level: {0}")]
    InvalidAutonomyLevel(String),

    /// Invalid approval result string value.
    #[error("Invalid approval result: {0}")]
    InvalidApprovalResult(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("agent.model".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn wraps_llm_error_into_top_level_error() {
        let err: Error = LlmError::Config("api key is empty".to_string()).into();
        assert!(err.to_string().contains("LLM error"));
        assert!(err.to_string().contains("api key is empty"));
    }

    #[test]
    fn iteration_limit_mentions_round_count() {
        let err = Error::IterationLimit(3);
        assert_eq!(err.to_string(), "Iteration limit reached after 3 tool rounds");
    }

    #[test]
    fn transient_classification_matches_taxonomy() {
        assert!(LlmError::Transport("reset".into()).is_transient());
        assert!(LlmError::RateLimit.is_transient());
        assert!(
            LlmError::Api {
                status: 503,
                message: "overloaded".into()
            }
            .is_transient()
        );
        assert!(
            !LlmError::Api {
                status: 400,
                message: "bad".into()
            }
            .is_transient()
        );
        assert!(!LlmError::Config("missing key".into()).is_transient());
        assert!(!LlmError::Protocol("garbage".into()).is_transient());
    }

    #[test]
    fn wraps_tool_and_database_errors() {
        let tool_err: Error = ToolError::InvalidArgs("missing command".to_string()).into();
        assert!(tool_err.to_string().contains("Tool error"));

        let db_err: Error = DatabaseError::Sqlx("locked".to_string()).into();
        assert!(db_err.to_string().contains("Database error"));
    }
}
