//! Top-level failure classes and their process exit codes.

use std::process::ExitCode;

use thiserror::Error;

use crate::config::ConfigError;
use crate::sender::SenderError;
use crate::transport::DeliveryError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sender(#[from] SenderError),

    /// A single diagnostic heartbeat did not go through.
    #[error("heartbeat not delivered: {0}")]
    Heartbeat(#[from] DeliveryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// 2 for bad configuration, 3 for rejected credentials, 4 when the
    /// collector could not be reached at all, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            AgentError::Config(_) => 2,
            AgentError::Sender(SenderError::AuthRejected { .. }) => 3,
            AgentError::Heartbeat(e) if e.is_auth() => 3,
            AgentError::Heartbeat(e) if e.is_transport() => 4,
            AgentError::Heartbeat(_) | AgentError::Other(_) => 1,
        }
    }
}

impl From<&AgentError> for ExitCode {
    fn from(e: &AgentError) -> Self {
        ExitCode::from(e.exit_code())
    }
}
