//! The transport seam between the session and a debugger backend.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConfigError;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Transport is closed")]
    Closed,
    #[error("Playback mismatch: expected {expected:?}, got \"{actual}\"")]
    PlaybackMismatch {
        /// `None` once the transcript has no more expected commands.
        expected: Option<String>,
        actual: String,
    },
}

/// Something a transport observed on the backend side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A line of the backend's MI output, without its line terminator.
    Stdout(String),
    /// A line the backend wrote to its error stream.
    Stderr(String),
    /// The connection ended. Sent exactly once, always last.
    Disconnected {
        exit_code: Option<i32>,
        reason: Option<String>,
    },
}

/// Outgoing half of a duplex line connection.
///
/// Incoming lines arrive on the event receiver handed out with the
/// transport in a [`Connection`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue `line` for writing; a newline is appended.
    ///
    /// Never waits for the backend to read.
    ///
    /// # Errors
    /// Returns error if the transport is closed or the peer rejected the line.
    fn send(&self, line: &str) -> Result<(), TransportError>;

    /// Release every resource behind the connection. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An established connection: the writer plus the ordered event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { transport, events }
    }
}
