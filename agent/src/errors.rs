use model_hub::HubError;
use thiserror::Error;

/// Errors that can occur in the worker agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// IO error (artifact files, external commands)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing handler, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error returned by the hub core
    #[error(transparent)]
    Hub(#[from] HubError),

    /// External converter or inference command failed
    #[error("Execution error: {0}")]
    Execution(String),

    /// A spawned task panicked or was aborted
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Config("no handler for INFER".to_string());
        assert_eq!(err.to_string(), "Configuration error: no handler for INFER");
    }

    #[test]
    fn test_hub_error_is_transparent() {
        let err: AgentError = HubError::NotFound("Upload abc not found".into()).into();
        assert_eq!(err.to_string(), HubError::NotFound("Upload abc not found".into()).to_string());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let agent_err: AgentError = io_err.into();
        assert!(agent_err.to_string().contains("IO error"));
    }
}
