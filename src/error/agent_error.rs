#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("delivery to {target} failed after {attempts} attempt(s): {reason}")]
    Transport {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("malformed message: missing required field `{field}`")]
    MalformedMessage { field: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent {agent} failed to register after {attempts} attempt(s)")]
    RegistrationFailed { agent: String, attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation cancelled")]
    Cancelled,
}
