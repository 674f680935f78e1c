//! Transcript files: recording live traffic and the format playback reads.
//!
//! ```text
//! # comment
//! ->=thread-group-added,id="i1"
//! ->(gdb)
//! <-1001-gdb-set mi-async on
//! ->1001^done
//! ```
//!
//! `<-` marks a line sent to the backend, `->` a line received from it.
//! Unprefixed lines count as received; blank lines and `#` comments are
//! ignored.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use mi_core::{Connection, Transport, TransportError, TransportEvent};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
};

pub const SENT_PREFIX: &str = "<-";
pub const RECEIVED_PREFIX: &str = "->";

/// One meaningful transcript line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptLine {
    Sent(String),
    Received(String),
}

/// Parse transcript text, skipping blanks and comments.
#[must_use]
pub fn parse_transcript(text: &str) -> Vec<TranscriptLine> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .map(|line| {
            if let Some(sent) = line.strip_prefix(SENT_PREFIX) {
                TranscriptLine::Sent(sent.to_string())
            } else {
                let received = line.strip_prefix(RECEIVED_PREFIX).unwrap_or(line);
                TranscriptLine::Received(received.to_string())
            }
        })
        .collect()
}

/// Appends sent and received lines to a transcript file.
#[derive(Clone)]
pub struct Recorder {
    lines: mpsc::UnboundedSender<String>,
}

impl Recorder {
    /// Create (or truncate) the transcript file.
    ///
    /// # Errors
    /// Returns error if the file cannot be created.
    pub async fn create(path: &Path) -> Result<Self, std::io::Error> {
        let file = File::create(path).await?;
        let (lines, mut rx) = mpsc::unbounded_channel::<String>();
        let shown = path.display().to_string();
        tokio::spawn(async move {
            let mut writer = BufWriter::new(file);
            while let Some(line) = rx.recv().await {
                let written: std::io::Result<()> = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::error!(path = %shown, "Failed to write transcript: {e}");
                    break;
                }
            }
        });
        Ok(Self { lines })
    }

    pub fn sent(&self, line: &str) {
        let _ = self.lines.send(format!("{SENT_PREFIX}{line}"));
    }

    pub fn received(&self, line: &str) {
        let _ = self.lines.send(format!("{RECEIVED_PREFIX}{line}"));
    }

    /// Record everything flowing through `connection`.
    #[must_use]
    pub fn wrap(self, connection: Connection) -> Connection {
        let Connection {
            transport,
            events: mut inner_events,
        } = connection;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let recorder = self.clone();
        tokio::spawn(async move {
            while let Some(event) = inner_events.recv().await {
                if let TransportEvent::Stdout(line) = &event {
                    recorder.received(line);
                }
                if events_tx.send(event).is_err() {
                    break;
                }
            }
        });
        let transport = Arc::new(RecordingTransport {
            inner: transport,
            recorder: self,
        });
        Connection::new(transport, events_rx)
    }
}

struct RecordingTransport {
    inner: Arc<dyn Transport>,
    recorder: Recorder,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        self.inner.send(line)?;
        self.recorder.sent(line);
        Ok(())
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcript() {
        let lines = parse_transcript(
            "# captured from gdb 14\n->(gdb)\r\n\n<-1001-exec-run\n1001^running\n   \n",
        );
        assert_eq!(
            lines,
            vec![
                TranscriptLine::Received("(gdb)".to_string()),
                TranscriptLine::Sent("1001-exec-run".to_string()),
                TranscriptLine::Received("1001^running".to_string()),
            ]
        );
    }
}
