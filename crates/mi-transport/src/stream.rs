//! Line transport over a pair of byte streams.
//!
//! One task writes queued lines, one task per input stream reads chunks and
//! splits them into lines, and a supervisor owning the child process reports
//! the single terminal [`TransportEvent::Disconnected`] once the readers hit
//! end of file, the child exits or the transport is stopped.

use std::{
    process::ExitStatus,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use command_group::AsyncGroupChild;
use mi_core::{Connection, Transport, TransportError, TransportEvent};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot, watch},
    task::{AbortHandle, JoinHandle},
};

use crate::line_buffer::LineBuffer;

const READ_CHUNK: usize = 8 * 1024;
/// How long `close` waits for queued lines to be flushed.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the supervisor waits for a closed child to exit.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long readers may drain after the child exited. Processes it started
/// can keep the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(100);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Pieces a [`StreamTransport`] is assembled from.
pub struct StreamParts {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    /// Process behind the streams, killed on close.
    pub child: Option<AsyncGroupChild>,
    /// Line written just before closing, e.g. `logout` for a remote shell.
    pub farewell: Option<String>,
}

impl StreamParts {
    /// Streams with no process behind them.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stdin: Box::new(writer),
            stdout: Box::new(reader),
            stderr: None,
            child: None,
            farewell: None,
        }
    }

    /// Take the stdio of a spawned process group.
    ///
    /// # Errors
    /// Returns error if stdin or stdout were not piped.
    pub fn from_child(mut child: AsyncGroupChild) -> Result<Self, TransportError> {
        let inner = child.inner();
        let stdin = inner
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("stdin not piped".to_string()))?;
        let stdout = inner
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("stdout not piped".to_string()))?;
        let stderr = inner.stderr.take().map(|s| Box::new(s) as BoxedReader);
        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
            farewell: None,
        })
    }

    #[must_use]
    pub fn with_stderr<E>(mut self, stderr: E) -> Self
    where
        E: AsyncRead + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(stderr));
        self
    }

    #[must_use]
    pub fn with_farewell(mut self, line: impl Into<String>) -> Self {
        self.farewell = Some(line.into());
        self
    }
}

enum WriterCommand {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Transport over byte streams, optionally owning a process group.
pub struct StreamTransport {
    writer: mpsc::UnboundedSender<WriterCommand>,
    /// `Some(reason)` once the transport has been asked to stop.
    shutdown: Arc<watch::Sender<Option<String>>>,
    closed: AtomicBool,
    farewell: Option<String>,
}

impl StreamTransport {
    /// Start the reader, writer and supervisor tasks.
    #[must_use]
    pub fn start(parts: StreamParts) -> Connection {
        let StreamParts {
            stdin,
            stdout,
            stderr,
            child,
            farewell,
        } = parts;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(watch::channel(None).0);

        tokio::spawn(write_loop(stdin, writer_rx, Arc::clone(&shutdown)));

        let mut readers = vec![tokio::spawn(read_loop(
            stdout,
            events_tx.clone(),
            shutdown.subscribe(),
            TransportEvent::Stdout,
        ))];
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(read_loop(
                stderr,
                events_tx.clone(),
                shutdown.subscribe(),
                TransportEvent::Stderr,
            )));
        }
        tokio::spawn(supervise(
            readers,
            child,
            shutdown.subscribe(),
            events_tx,
        ));

        let transport = Arc::new(Self {
            writer: writer_tx,
            shutdown,
            closed: AtomicBool::new(false),
            farewell,
        });
        Connection::new(transport, events_rx)
    }

    async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(ack_tx)).is_ok()
            && tokio::time::timeout(FLUSH_TIMEOUT, ack_rx).await.is_err()
        {
            tracing::warn!("Timed out flushing transport writer");
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.writer
            .send(WriterCommand::Line(line.to_string()))
            .map_err(|_| TransportError::ConnectionLost("writer stopped".to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(farewell) = &self.farewell {
            let _ = self.writer.send(WriterCommand::Line(farewell.clone()));
        }
        self.flush().await;
        // The supervisor kills the process group once it sees the reason.
        stop(&self.shutdown, "transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        stop(&self.shutdown, "transport dropped");
    }
}

fn stop(shutdown: &watch::Sender<Option<String>>, why: &str) {
    shutdown.send_if_modified(|reason| {
        if reason.is_none() {
            *reason = Some(why.to_string());
            true
        } else {
            false
        }
    });
}

async fn write_loop(
    stdin: BoxedWriter,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    shutdown: Arc<watch::Sender<Option<String>>>,
) {
    let mut stdin = BufWriter::new(stdin);
    let mut stop_rx = shutdown.subscribe();
    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            _ = stop_rx.changed() => None,
        };
        let Some(command) = command else { break };
        match command {
            WriterCommand::Line(line) => {
                tracing::trace!(%line, "-> backend");
                let written: std::io::Result<()> = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::error!("Error writing to backend: {e}");
                    stop(&shutdown, &format!("write failed: {e}"));
                    break;
                }
            }
            WriterCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    let _ = stdin.shutdown().await;
}

async fn read_loop(
    mut reader: BoxedReader,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<Option<String>>,
    wrap: fn(String) -> TransportEvent,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let deliver = |line: String| {
        if !line.trim().is_empty() {
            let _ = events.send(wrap(line));
        }
    };

    if shutdown.borrow().is_some() {
        return;
    }
    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        deliver(line);
                    }
                }
                Err(e) => {
                    tracing::error!("Error reading from backend: {e}");
                    break;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
    if let Some(tail) = buffer.finish() {
        deliver(tail);
    }
}

/// Why the supervisor stopped waiting.
enum Ended {
    Exited(std::io::Result<ExitStatus>),
    ReadersDone,
    Stopped,
}

async fn supervise(
    readers: Vec<JoinHandle<()>>,
    child: Option<AsyncGroupChild>,
    mut shutdown: watch::Receiver<Option<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
    let readers_done = async move {
        for reader in readers {
            match reader.await {
                Err(e) if !e.is_cancelled() => {
                    tracing::error!("Transport reader task failed: {e}");
                }
                _ => {}
            }
        }
    };
    tokio::pin!(readers_done);

    let exit_code = match child {
        Some(mut child) => {
            let ended = tokio::select! {
                status = child.wait() => Ended::Exited(status),
                () = &mut readers_done => Ended::ReadersDone,
                () = stopped(&mut shutdown) => Ended::Stopped,
            };
            match ended {
                Ended::Exited(status) => {
                    if tokio::time::timeout(READER_GRACE, readers_done.as_mut())
                        .await
                        .is_err()
                    {
                        tracing::debug!("Backend exited with its output pipes still open");
                        for abort in &aborts {
                            abort.abort();
                        }
                        // Descendants still in the group hold the pipes.
                        let _ = child.start_kill();
                    }
                    match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            tracing::debug!("Failed to wait for backend process: {e}");
                            None
                        }
                    }
                }
                Ended::ReadersDone => wait_for_exit(&mut child).await,
                Ended::Stopped => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Failed to kill backend process group: {e}");
                    }
                    readers_done.as_mut().await;
                    wait_for_exit(&mut child).await
                }
            }
        }
        None => {
            readers_done.as_mut().await;
            None
        }
    };

    let reason = shutdown.borrow().clone().or_else(|| {
        Some(match exit_code {
            Some(code) => format!("backend exited with code {code}"),
            None => "connection closed by backend".to_string(),
        })
    });
    tracing::debug!(?exit_code, ?reason, "Transport disconnected");
    let _ = events.send(TransportEvent::Disconnected { exit_code, reason });
}

/// Resolves once a stop reason is set, or the transport is gone.
async fn stopped(shutdown: &mut watch::Receiver<Option<String>>) {
    while shutdown.borrow_and_update().is_none() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_exit(child: &mut AsyncGroupChild) -> Option<i32> {
    match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::debug!("Failed to wait for backend process: {e}");
            None
        }
        Err(_) => {
            let _ = child.start_kill();
            None
        }
    }
}
