//! Commands sent to the backend whose result has not arrived yet.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use mi_core::{ResultClass, ResultRecord};
use tokio::sync::oneshot;

use crate::error::SessionError;

/// What a completed command hands back to its caller.
#[derive(Debug)]
pub struct Completion {
    pub record: ResultRecord,
    /// Console and log stream text captured while the command ran.
    pub captured: Option<String>,
}

pub type CompletionResult = Result<Completion, SessionError>;

/// One in-flight command.
pub struct PendingCommand {
    /// Table-unique id, also for untokenized commands.
    pub id: u64,
    pub token: Option<u32>,
    pub command: String,
    pub expected: Option<ResultClass>,
    pub created: Instant,
    echo_seen: bool,
    captured: Option<String>,
    completion: oneshot::Sender<CompletionResult>,
}

impl PendingCommand {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Resolve the waiting caller. Returns false if it already gave up.
    pub fn complete(self, result: Result<ResultRecord, SessionError>) -> bool {
        tracing::debug!(
            token = ?self.token,
            command = %self.command,
            elapsed_ms = self.elapsed().as_millis(),
            ok = result.is_ok(),
            "Command completed"
        );
        let captured = self.captured;
        self.completion
            .send(result.map(|record| Completion { record, captured }))
            .is_ok()
    }
}

/// Who an untokenized result record belongs to.
pub enum UntokenizedOwner {
    /// A fire-and-forget post; nobody waits for it.
    Post,
    Command(PendingCommand),
    Nobody,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    by_token: HashMap<u32, PendingCommand>,
    /// CLI commands, completed in order by untokenized results.
    untokenized: VecDeque<PendingCommand>,
    /// Untokenized results still owed to fire-and-forget posts.
    posted: usize,
}

/// Pending commands keyed by token.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a command before it is written. Returns its id and the
    /// receiver its result is delivered on.
    pub fn insert(
        &self,
        token: Option<u32>,
        command: &str,
        expected: Option<ResultClass>,
        capture: bool,
    ) -> (u64, oneshot::Receiver<CompletionResult>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        let pending = PendingCommand {
            id,
            token,
            command: command.to_string(),
            expected,
            created: Instant::now(),
            echo_seen: false,
            captured: capture.then(String::new),
            completion: tx,
        };
        match token {
            Some(token) => {
                inner.by_token.insert(token, pending);
            }
            None => inner.untokenized.push_back(pending),
        }
        (id, rx)
    }

    /// Remove a command by id, e.g. on timeout or cancellation.
    pub fn remove(&self, token: Option<u32>, id: u64) -> Option<PendingCommand> {
        let mut inner = self.inner();
        match token {
            Some(token) => {
                if inner.by_token.get(&token).is_some_and(|p| p.id == id) {
                    inner.by_token.remove(&token)
                } else {
                    None
                }
            }
            None => {
                let index = inner.untokenized.iter().position(|p| p.id == id)?;
                inner.untokenized.remove(index)
            }
        }
    }

    pub fn take_tokenized(&self, token: u32) -> Option<PendingCommand> {
        self.inner().by_token.remove(&token)
    }

    /// Claim an untokenized result for whoever sent the matching command.
    pub fn take_untokenized(&self) -> UntokenizedOwner {
        let mut inner = self.inner();
        if inner.posted > 0 {
            inner.posted -= 1;
            return UntokenizedOwner::Post;
        }
        inner
            .untokenized
            .pop_front()
            .map_or(UntokenizedOwner::Nobody, UntokenizedOwner::Command)
    }

    pub fn note_post(&self) {
        self.inner().posted += 1;
    }

    /// Undo `note_post` for a post that never reached the backend.
    pub fn cancel_post(&self) {
        let mut inner = self.inner();
        inner.posted = inner.posted.saturating_sub(1);
    }

    /// True the first time the backend echoes a pending command.
    pub fn consume_echo(&self, token: u32) -> bool {
        match self.inner().by_token.get_mut(&token) {
            Some(pending) if !pending.echo_seen => {
                pending.echo_seen = true;
                true
            }
            _ => false,
        }
    }

    /// Append stream text to the oldest command capturing output, if any.
    pub fn capture(&self, text: &str) -> bool {
        let mut inner = self.inner();
        let Inner {
            by_token,
            untokenized,
            ..
        } = &mut *inner;
        let capturing = by_token
            .values_mut()
            .chain(untokenized.iter_mut())
            .filter(|p| p.captured.is_some())
            .min_by_key(|p| p.id)
            .and_then(|p| p.captured.as_mut());
        match capturing {
            Some(buffer) => {
                buffer.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Remove every pending command.
    pub fn drain(&self) -> Vec<PendingCommand> {
        let mut inner = self.inner();
        inner.posted = 0;
        let mut drained: Vec<PendingCommand> = inner.by_token.drain().map(|(_, p)| p).collect();
        drained.extend(inner.untokenized.drain(..));
        drained.sort_by_key(|p| p.id);
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner();
        inner.by_token.len() + inner.untokenized.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use mi_core::Tuple;

    use super::*;

    fn done(token: Option<u32>) -> ResultRecord {
        ResultRecord {
            token,
            class: ResultClass::Done,
            results: Tuple::default(),
        }
    }

    #[tokio::test]
    async fn test_complete_by_token() {
        let table = PendingTable::new();
        let (_, rx_a) = table.insert(Some(1), "-a", Some(ResultClass::Done), false);
        let (_, rx_b) = table.insert(Some(2), "-b", None, false);
        assert_eq!(table.len(), 2);

        let b = table.take_tokenized(2).unwrap();
        assert_eq!(b.command, "-b");
        assert!(b.complete(Ok(done(Some(2)))));
        assert_eq!(rx_b.await.unwrap().unwrap().record.token, Some(2));

        assert!(table.take_tokenized(2).is_none());
        drop(rx_a);
        let a = table.take_tokenized(1).unwrap();
        assert!(!a.complete(Ok(done(Some(1)))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_checks_id() {
        let table = PendingTable::new();
        let (first, _rx) = table.insert(Some(5), "-a", None, false);
        assert!(table.remove(Some(5), first + 1).is_none());
        assert!(table.remove(Some(5), first).is_some());

        let (id, _rx2) = table.insert(None, "info frame", None, false);
        assert!(table.remove(None, id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_untokenized_posts_are_claimed_first() {
        let table = PendingTable::new();
        table.note_post();
        let (id, _rx) = table.insert(None, "info frame", None, false);
        assert!(matches!(table.take_untokenized(), UntokenizedOwner::Post));
        match table.take_untokenized() {
            UntokenizedOwner::Command(pending) => assert_eq!(pending.id, id),
            _ => panic!("expected the pending CLI command"),
        }
        assert!(matches!(table.take_untokenized(), UntokenizedOwner::Nobody));
    }

    #[test]
    fn test_cancelled_post_owes_nothing() {
        let table = PendingTable::new();
        table.note_post();
        table.cancel_post();
        table.cancel_post();
        let (id, _rx) = table.insert(None, "info frame", None, false);
        match table.take_untokenized() {
            UntokenizedOwner::Command(pending) => assert_eq!(pending.id, id),
            _ => panic!("expected the pending CLI command"),
        }
    }

    #[tokio::test]
    async fn test_capture_goes_to_oldest_capturing_command() {
        let table = PendingTable::new();
        let (_, _rx7) = table.insert(Some(7), "-stack-list-frames", None, false);
        let (_, older) = table.insert(Some(9), "-interpreter-exec console \"bt\"", None, true);
        let (_, newer) = table.insert(Some(2), "-interpreter-exec console \"info\"", None, true);
        for chunk in ["#0 main\n", "#1 start\n"] {
            assert!(table.capture(chunk));
        }

        for pending in table.drain() {
            let token = pending.token;
            pending.complete(Ok(done(token)));
        }
        let older = older.await.unwrap().unwrap();
        assert_eq!(older.captured.as_deref(), Some("#0 main\n#1 start\n"));
        let newer = newer.await.unwrap().unwrap();
        assert_eq!(newer.captured.as_deref(), Some(""));
    }

    #[test]
    fn test_echo_consumed_once() {
        let table = PendingTable::new();
        let (_, _rx) = table.insert(Some(9), "-exec-next", None, false);
        assert!(table.consume_echo(9));
        assert!(!table.consume_echo(9));
        assert!(!table.consume_echo(10));
    }

    #[tokio::test]
    async fn test_capture_and_drain() {
        let table = PendingTable::new();
        assert!(!table.capture("ignored"));
        let (_, rx) = table.insert(Some(3), "-interpreter-exec console \"info\"", None, true);
        let (_, _rx4) = table.insert(Some(4), "-stack-list-frames", None, false);
        assert!(table.capture("line 1\n"));
        assert!(table.capture("line 2\n"));

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        for pending in drained {
            if pending.token == Some(3) {
                pending.complete(Ok(done(Some(3))));
            }
        }
        let completion = rx.await.unwrap().unwrap();
        assert_eq!(completion.captured.as_deref(), Some("line 1\nline 2\n"));
    }
}
