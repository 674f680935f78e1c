//! The session: serializes commands to the backend and routes its output.
//!
//! Every command is sent while holding the [`CommandLock`], tagged with a
//! fresh token, and registered in the pending table before it is written.
//! A single reader task classifies backend output: result records complete
//! their pending command, everything else goes to subscribers in arrival
//! order.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use mi_core::{
    Connection, LaunchConfig, Record, ResultClass, ResultRecord, Transport, TransportError,
    TransportEvent, Tuple, escape, parse_record,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    error::{LockError, SessionError},
    events::{EventHub, SessionEvent},
    lock::{CommandLock, ExclusiveToken, LockStatus, SharedLockGuard},
    pending::{PendingCommand, PendingTable, UntokenizedOwner},
};

/// First token handed out by a new session.
pub const DEFAULT_FIRST_TOKEN: u32 = 1001;

/// How long `close` waits for the reader task to wind down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// MI command prefixes that change execution or debugger state.
const EXCLUSIVE_PREFIXES: &[&str] = &[
    "-exec-",
    "-break-",
    "-dprintf-",
    "-catch-",
    "-target-",
    "-file-",
    "-environment-",
    "-interpreter-exec",
    "-thread-select",
    "-stack-select-frame",
    "-gdb-exit",
];

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub first_token: u32,
    /// Applied to commands that do not set their own timeout.
    pub default_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            first_token: DEFAULT_FIRST_TOKEN,
            default_timeout: None,
        }
    }
}

/// How a command holds the command lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Exclusive,
    Shared,
}

impl LockKind {
    /// Infer the lock a command needs from its text.
    ///
    /// Console commands are always exclusive: their effect cannot be read
    /// from their syntax.
    #[must_use]
    pub fn for_command(text: &str) -> Self {
        let text = text.trim_start();
        if !text.starts_with('-') || EXCLUSIVE_PREFIXES.iter().any(|p| text.starts_with(p)) {
            Self::Exclusive
        } else {
            Self::Shared
        }
    }
}

/// A command to send, with the result class it must produce.
#[derive(Debug, Clone)]
pub struct Command {
    text: String,
    expected: Option<ResultClass>,
    lock: LockKind,
    timeout: Option<Duration>,
    capture: bool,
}

impl Command {
    /// A command expecting `^done`, with its lock kind inferred.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let lock = LockKind::for_command(&text);
        Self {
            text,
            expected: Some(ResultClass::Done),
            lock,
            timeout: None,
            capture: false,
        }
    }

    #[must_use]
    pub fn expecting(mut self, class: ResultClass) -> Self {
        self.expected = Some(class);
        self
    }

    /// Resolve with whatever result class the backend returns.
    #[must_use]
    pub fn accept_any(mut self) -> Self {
        self.expected = None;
        self
    }

    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.lock = LockKind::Exclusive;
        self
    }

    /// Ignored for console commands and capturing commands, which are
    /// always exclusive.
    #[must_use]
    pub fn shared(mut self) -> Self {
        self.lock = LockKind::Shared;
        self
    }

    #[must_use]
    pub fn timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    /// Collect console and log stream output produced while it runs.
    ///
    /// Stream output carries no token, so capturing commands never overlap.
    #[must_use]
    pub fn capture_output(mut self) -> Self {
        self.capture = true;
        self
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// MI commands get a token; console commands go out verbatim.
    fn is_tokenized(&self) -> bool {
        self.text.starts_with('-')
    }

    fn lock_kind(&self) -> LockKind {
        if self.is_tokenized() && !self.capture {
            self.lock
        } else {
            LockKind::Exclusive
        }
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// The result of a command.
#[derive(Debug)]
pub struct Response {
    pub record: ResultRecord,
    /// Console and log output, if the command captured it.
    pub captured: Option<String>,
    exclusive: Option<ExclusiveToken>,
}

impl Response {
    #[must_use]
    pub const fn class(&self) -> ResultClass {
        self.record.class
    }

    #[must_use]
    pub const fn results(&self) -> &Tuple {
        &self.record.results
    }

    #[must_use]
    pub fn into_results(self) -> Tuple {
        self.record.results
    }

    /// The exclusive hold an exclusive command left in place.
    ///
    /// The lock stays held until the token is closed, converted or dropped,
    /// so callers can keep it through a following stop notification.
    /// Dropping the response without taking it releases the lock.
    pub fn take_exclusive(&mut self) -> Option<ExclusiveToken> {
        self.exclusive.take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Starting,
    Ready,
    Failed(Vec<String>),
}

struct Shared {
    id: Uuid,
    transport: Arc<dyn Transport>,
    lock: CommandLock,
    pending: PendingTable,
    events: EventHub,
    next_token: AtomicU32,
    ready: watch::Sender<Readiness>,
    /// Stderr lines seen before the first prompt.
    startup_stderr: Mutex<Vec<String>>,
    options: SessionOptions,
}

/// One debugger session over one transport.
pub struct Session {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect to the backend described by `config`.
    ///
    /// # Errors
    /// Returns error if the connection cannot be established.
    pub async fn start(config: &LaunchConfig, options: SessionOptions) -> Result<Self, SessionError> {
        let connection = mi_transport::connect(config).await?;
        Ok(Self::new(connection, options))
    }

    /// Run a session over an established connection.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(connection: Connection, options: SessionOptions) -> Self {
        let Connection { transport, events } = connection;
        let id = Uuid::new_v4();
        let shared = Arc::new(Shared {
            id,
            transport,
            lock: CommandLock::new(),
            pending: PendingTable::new(),
            events: EventHub::new(),
            next_token: AtomicU32::new(options.first_token),
            ready: watch::channel(Readiness::Starting).0,
            startup_stderr: Mutex::new(Vec::new()),
            options,
        });
        tracing::info!(session_id = %id, "Starting debugger session");
        let pump = tokio::spawn(
            pump(Arc::clone(&shared), events).instrument(tracing::info_span!("mi_session", %id)),
        );
        Self {
            shared,
            pump: Mutex::new(Some(pump)),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Send a command and wait for its result.
    ///
    /// Exclusive commands leave the lock held in the returned response; see
    /// [`Response::take_exclusive`]. Shared holds end with the result.
    ///
    /// # Errors
    /// Returns error if the session is closed, the connection fails, the
    /// command times out or the backend answers with another result class
    /// than expected.
    pub async fn send(&self, command: impl Into<Command>) -> Result<Response, SessionError> {
        let command = command.into();
        match command.lock_kind() {
            LockKind::Exclusive => {
                let token = self.shared.lock.acquire_exclusive().await?;
                let mut response = self.dispatch(&command).await?;
                response.exclusive = Some(token);
                Ok(response)
            }
            LockKind::Shared => {
                let guard = self.shared.lock.acquire_shared().await?;
                let response = self.dispatch(&command).await;
                guard.release();
                response
            }
        }
    }

    /// Send a command under an exclusive hold the caller already owns.
    ///
    /// # Errors
    /// Returns `TokenClosed` if the token is closed or belongs to another
    /// session, otherwise as [`Session::send`].
    pub async fn send_exclusive(
        &self,
        token: &ExclusiveToken,
        command: impl Into<Command>,
    ) -> Result<Response, SessionError> {
        if !token.belongs_to(&self.shared.lock) {
            return Err(SessionError::TokenClosed);
        }
        self.dispatch(&command.into()).await
    }

    /// Take the command lock exclusively, e.g. to run several commands
    /// back to back with [`Session::send_exclusive`].
    ///
    /// # Errors
    /// Returns error if the session is closed.
    pub async fn acquire_exclusive(&self) -> Result<ExclusiveToken, SessionError> {
        Ok(self.shared.lock.acquire_exclusive().await?)
    }

    /// # Errors
    /// Returns error if the session is closed.
    pub async fn acquire_shared(&self) -> Result<SharedLockGuard, SessionError> {
        Ok(self.shared.lock.acquire_shared().await?)
    }

    /// Run a console command and return the text it printed.
    ///
    /// # Errors
    /// As [`Session::send`].
    pub async fn console_command(&self, text: &str) -> Result<String, SessionError> {
        let command = Command::new(format!("-interpreter-exec console \"{}\"", escape(text)))
            .exclusive()
            .capture_output();
        let response = self.send(command).await?;
        Ok(response.captured.unwrap_or_default())
    }

    /// Send text without waiting for, or checking, its result.
    ///
    /// Ignored once the session is closed.
    pub async fn post(&self, text: &str) {
        let Ok(guard) = self.shared.lock.acquire_shared().await else {
            tracing::debug!(text, "Ignoring post to closed session");
            return;
        };
        // Noted first: the result may be read before `send` returns.
        self.shared.pending.note_post();
        if let Err(e) = self.shared.transport.send(text) {
            self.shared.pending.cancel_post();
            tracing::debug!("Failed to post '{text}': {e}");
        }
        guard.release();
    }

    /// Wait for the backend's first prompt.
    ///
    /// # Errors
    /// Returns `InitializeFailed` with the stderr collected so far if the
    /// connection ends first.
    pub async fn wait_until_ready(&self) -> Result<(), SessionError> {
        let mut ready = self.shared.ready.subscribe();
        let state = ready
            .wait_for(|state| *state != Readiness::Starting)
            .await
            .map(|state| state.clone())
            .map_err(|_| LockError::Disposed("session dropped".to_string()))?;
        match state {
            Readiness::Failed(stderr) => Err(SessionError::InitializeFailed { stderr }),
            _ => Ok(()),
        }
    }

    /// Out-of-band events, in arrival order.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiverStream<SessionEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn lock_status(&self) -> LockStatus {
        self.shared.lock.status()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock.is_closed()
    }

    /// Commands sent and still waiting for their result.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the lock and the transport, failing every outstanding command.
    pub async fn close(&self) {
        self.shared.lock.close("session closed");
        self.shared.transport.close().await;
        let pump = self.pump_handle().take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut pump).await.is_err() {
                tracing::warn!(session_id = %self.shared.id, "Session reader did not stop");
                pump.abort();
            }
        }
    }

    fn pump_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, command: &Command) -> Result<Response, SessionError> {
        let shared = &self.shared;
        let token = command
            .is_tokenized()
            .then(|| shared.next_token.fetch_add(1, Ordering::Relaxed));
        let (id, completion) =
            shared
                .pending
                .insert(token, &command.text, command.expected, command.capture);
        let _registration = Registration {
            pending: &shared.pending,
            token,
            id,
        };

        // Registered before the check: the reader fails whatever it drains
        // after closing the lock.
        if let LockStatus::Closed(message) = shared.lock.status() {
            return Err(LockError::Disposed(message).into());
        }

        let line = match token {
            Some(token) => format!("{token}{}", command.text),
            None => command.text.clone(),
        };
        tracing::debug!(?token, command = %command.text, "Sending command");
        shared.transport.send(&line)?;

        let received = match command.timeout.or(shared.options.default_timeout) {
            Some(after) => tokio::time::timeout(after, completion).await.map_err(|_| {
                tracing::warn!(?token, command = %command.text, ?after, "Command timed out");
                SessionError::Timeout {
                    token,
                    command: command.text.clone(),
                    after,
                }
            })?,
            None => completion.await,
        };
        let completion =
            received.map_err(|_| LockError::Disposed("session dropped".to_string()))??;
        Ok(Response {
            record: completion.record,
            captured: completion.captured,
            exclusive: None,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(pump) = self.pump_handle().take() {
            self.shared.lock.close("session dropped");
            pump.abort();
        }
    }
}

/// Removes a pending command whose caller stopped waiting.
struct Registration<'a> {
    pending: &'a PendingTable,
    token: Option<u32>,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.pending.remove(self.token, self.id).is_some() {
            tracing::debug!(token = ?self.token, "Dropped pending command");
        }
    }
}

async fn pump(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    let (exit_code, reason) = loop {
        match events.recv().await {
            Some(TransportEvent::Stdout(line)) => shared.on_line(&line),
            Some(TransportEvent::Stderr(line)) => shared.on_stderr(line),
            Some(TransportEvent::Disconnected { exit_code, reason }) => break (exit_code, reason),
            None => break (None, None),
        }
    };
    shared.shut_down(exit_code, reason).await;
}

impl Shared {
    fn on_line(&self, line: &str) {
        tracing::trace!(line, "<- backend");
        let record = match parse_record(line) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%error, line, "Unparseable backend output");
                self.events.publish(SessionEvent::Malformed {
                    line: line.to_string(),
                    error,
                });
                return;
            }
        };

        if let Record::ConsoleStream(text) | Record::LogStream(text) = &record {
            self.pending.capture(text);
        }
        match record {
            Record::Prompt => self.mark_ready(),
            Record::Result(result) => self.on_result(result),
            Record::Echo {
                token: Some(token), ..
            } if self.pending.consume_echo(token) => {}
            other => self.events.publish(SessionEvent::Record(other)),
        }
    }

    fn on_result(&self, result: ResultRecord) {
        match result.token {
            Some(token) => match self.pending.take_tokenized(token) {
                Some(pending) => resolve(pending, result),
                None => tracing::warn!(
                    token,
                    class = %result.class,
                    "Discarding result with no pending command"
                ),
            },
            None => match self.pending.take_untokenized() {
                UntokenizedOwner::Command(pending) => resolve(pending, result),
                UntokenizedOwner::Post | UntokenizedOwner::Nobody => {
                    self.events
                        .publish(SessionEvent::Record(Record::Result(result)));
                }
            },
        }
    }

    fn on_stderr(&self, line: String) {
        tracing::debug!(%line, "Backend stderr");
        if *self.ready.borrow() == Readiness::Starting {
            self.stderr_log().push(line.clone());
        }
        self.events.publish(SessionEvent::Stderr(line));
    }

    fn stderr_log(&self) -> MutexGuard<'_, Vec<String>> {
        self.startup_stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_ready(&self) {
        let became_ready = self.ready.send_if_modified(|state| {
            if *state == Readiness::Starting {
                *state = Readiness::Ready;
                true
            } else {
                false
            }
        });
        if became_ready {
            self.stderr_log().clear();
            tracing::info!("Debugger ready");
        }
    }

    async fn shut_down(&self, exit_code: Option<i32>, reason: Option<String>) {
        let message = reason
            .clone()
            .unwrap_or_else(|| "debugger connection lost".to_string());
        tracing::info!(?exit_code, %message, "Debugger disconnected");
        self.lock.close(message.clone());

        for pending in self.pending.drain() {
            pending.complete(Err(TransportError::ConnectionLost(message.clone()).into()));
        }

        let stderr = std::mem::take(&mut *self.stderr_log());
        self.ready.send_if_modified(|state| {
            if *state == Readiness::Starting {
                *state = Readiness::Failed(stderr);
                true
            } else {
                false
            }
        });
        self.events
            .close(SessionEvent::Disconnected { exit_code, reason });
        self.transport.close().await;
    }
}

/// Complete a pending command, checking the result class it expected.
fn resolve(pending: PendingCommand, result: ResultRecord) {
    let outcome = match pending.expected {
        Some(expected) if expected != result.class => Err(SessionError::UnexpectedResult {
            command: pending.command.clone(),
            expected,
            actual: result.class,
            message: result.error_message().map_or_else(
                || format!("unexpected result class '{}'", result.class),
                str::to_string,
            ),
        }),
        _ => Ok(result),
    };
    let token = pending.token;
    if !pending.complete(outcome) {
        tracing::debug!(?token, "Caller stopped waiting for result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_kind_inference() {
        assert_eq!(LockKind::for_command("-exec-continue"), LockKind::Exclusive);
        assert_eq!(LockKind::for_command("-break-insert main"), LockKind::Exclusive);
        assert_eq!(LockKind::for_command("-gdb-exit"), LockKind::Exclusive);
        assert_eq!(LockKind::for_command("info registers"), LockKind::Exclusive);
        assert_eq!(
            LockKind::for_command("-data-evaluate-expression x"),
            LockKind::Shared
        );
        assert_eq!(LockKind::for_command("-stack-list-frames"), LockKind::Shared);
        assert_eq!(LockKind::for_command("-gdb-set mi-async on"), LockKind::Shared);
    }

    #[test]
    fn test_command_builder() {
        let command = Command::new("-data-list-register-names")
            .exclusive()
            .accept_any()
            .timeout(Duration::from_secs(1));
        assert_eq!(command.lock_kind(), LockKind::Exclusive);
        assert_eq!(command.expected, None);
        assert_eq!(command.timeout, Some(Duration::from_secs(1)));
        assert!(command.is_tokenized());

        let capturing = Command::new("-data-evaluate-expression x")
            .shared()
            .capture_output();
        assert_eq!(capturing.lock_kind(), LockKind::Exclusive);

        let console = Command::from("info frame").shared();
        assert!(!console.is_tokenized());
        assert_eq!(console.lock_kind(), LockKind::Exclusive);
        assert_eq!(console.expected, Some(ResultClass::Done));
    }
}
