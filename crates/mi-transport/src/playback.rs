//! Deterministic replay of a recorded transcript.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use mi_core::{Connection, Transport, TransportError, TransportEvent};
use tokio::sync::mpsc;

use crate::transcript::{TranscriptLine, parse_transcript};

struct PlaybackState {
    remaining: VecDeque<TranscriptLine>,
    /// `None` once disconnected.
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl PlaybackState {
    /// Deliver received lines up to the next expected send.
    fn play_output(&mut self) {
        while let Some(TranscriptLine::Received(line)) = self.remaining.front() {
            if let Some(events) = &self.events {
                let _ = events.send(TransportEvent::Stdout(line.clone()));
            }
            self.remaining.pop_front();
        }
    }

    fn disconnect(&mut self, reason: String) {
        if let Some(events) = self.events.take() {
            let _ = events.send(TransportEvent::Disconnected {
                exit_code: None,
                reason: Some(reason),
            });
        }
    }
}

/// Replays a transcript: every sent line must match the next `<-` entry.
///
/// The first mismatch, or a send after the last expected command, ends the
/// connection with the mismatch as its reason.
pub struct PlaybackTransport {
    state: Mutex<PlaybackState>,
}

impl PlaybackTransport {
    /// Load and start replaying a transcript file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read.
    pub async fn open(path: &Path) -> Result<Connection, TransportError> {
        let text = tokio::fs::read_to_string(path).await?;
        tracing::debug!(path = %path.display(), "Replaying transcript");
        Ok(Self::from_transcript(&text))
    }

    /// Start replaying transcript text. Output preceding the first expected
    /// command is delivered immediately.
    #[must_use]
    pub fn from_transcript(text: &str) -> Connection {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut state = PlaybackState {
            remaining: parse_transcript(text).into(),
            events: Some(events_tx),
        };
        state.play_output();
        let transport = Arc::new(Self {
            state: Mutex::new(state),
        });
        Connection::new(transport, events_rx)
    }

    fn state(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for PlaybackTransport {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TransportError::Closed);
        }
        match state.remaining.pop_front() {
            Some(TranscriptLine::Sent(expected)) if expected == line => {
                state.play_output();
                Ok(())
            }
            other => {
                let expected = match other {
                    Some(TranscriptLine::Sent(expected)) => Some(expected),
                    _ => None,
                };
                let err = TransportError::PlaybackMismatch {
                    expected,
                    actual: line.to_string(),
                };
                tracing::warn!("{err}");
                state.disconnect(err.to_string());
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.state().disconnect("transport closed".to_string());
    }

    fn is_closed(&self) -> bool {
        self.state().events.is_none()
    }
}
