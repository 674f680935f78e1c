//! Session error types.

use std::time::Duration;

use mi_core::{FieldAccessError, ParseError, ResultClass, TransportError};
use thiserror::Error;

/// The command lock has been closed together with its session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Debugger session closed: {0}")]
    Disposed(String),
}

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Field(#[from] FieldAccessError),
    /// The backend answered with another result class than expected.
    ///
    /// `message` is the backend's `msg` text, unmodified.
    #[error("{message}")]
    UnexpectedResult {
        command: String,
        expected: ResultClass,
        actual: ResultClass,
        message: String,
    },
    #[error(transparent)]
    Disposed(#[from] LockError),
    #[error("Command '{command}' timed out after {after:?}")]
    Timeout {
        token: Option<u32>,
        command: String,
        after: Duration,
    },
    #[error("Debugger failed to initialize: {}", stderr.join("\n"))]
    InitializeFailed { stderr: Vec<String> },
    #[error("Exclusive token is already closed")]
    TokenClosed,
}

impl SessionError {
    /// Backend text of an unexpected `^error` result.
    #[must_use]
    pub fn backend_message(&self) -> Option<&str> {
        match self {
            Self::UnexpectedResult { message, .. } => Some(message),
            _ => None,
        }
    }

    /// True for errors that end the whole session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Disposed(_))
    }
}
