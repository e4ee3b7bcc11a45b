//! Session controller errors.

use crate::escalation::EmptyStack;
use crate::runtime::{LoadError, RuntimeError};
use crate::sinks::SinkError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active agent")]
    NoActiveAgent,

    #[error(transparent)]
    EmptyStack(#[from] EmptyStack),

    #[error("failed to load {target}: {source}")]
    Load {
        target: String,
        #[source]
        source: LoadError,
    },

    #[error("node '{node_id}' is not waiting for input")]
    NotBlocked { node_id: String },

    #[error("subscription failed: {0}")]
    Subscription(#[source] RuntimeError),

    #[error("sink dispatch failed: {0}")]
    Dispatch(#[from] SinkError),

    #[error("superseded by a newer escalation operation")]
    Superseded,

    #[error(transparent)]
    Runtime(RuntimeError),
}

impl From<RuntimeError> for SessionError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotBlocked { node_id } => Self::NotBlocked { node_id },
            other => Self::Runtime(other),
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
