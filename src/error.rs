//! Error types for exitpact.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown receiver: {receiver}")]
    UnknownReceiver { receiver: String },

    #[error("Malformed {message_type} payload for {agent}: {reason}")]
    MalformedPayload {
        agent: String,
        message_type: String,
        reason: String,
    },

    #[error("Commitment {commitment_id} cannot move from {from} to {to}")]
    InvalidTransition {
        commitment_id: String,
        from: String,
        to: String,
    },

    #[error("Commitment {commitment_id} could not be executed: {reason}")]
    Execution {
        commitment_id: String,
        reason: String,
    },

    #[error("Unknown commitment: {0}")]
    UnknownCommitment(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a malformed payload error.
    pub fn malformed(
        agent: impl Into<String>,
        message_type: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedPayload {
            agent: agent.into(),
            message_type: message_type.to_string(),
            reason: reason.into(),
        }
    }
}
