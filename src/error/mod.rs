pub mod agent_error;

use std::io;

use thiserror::Error as ThisError;

use crate::error::agent_error::AgentError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serde_json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("serde_yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("agent error: {0}")]
    AgentError(#[from] AgentError),
}

impl Error {
    /// Connection-level failures that a retry may cure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::AgentError(AgentError::Transport { .. })
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
