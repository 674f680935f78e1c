//! Exclusive/shared serialization of commands sent to the backend.
//!
//! A debugger backend runs one command at a time. Commands that change
//! execution state (run, step, breakpoints) take the lock exclusively and
//! overlap with nothing. Read-only queries share it and may be in flight
//! together.
//!
//! Exclusive waiters are resumed in FIFO order. Shared waiters that queue up
//! behind an exclusive holder are resumed together when it lets go.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;

use crate::error::LockError;

type ExclusiveWaiter = oneshot::Sender<Result<ExclusiveToken, LockError>>;
type SharedWaiter = oneshot::Sender<Result<SharedLockGuard, LockError>>;

/// Observable lock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Idle,
    Exclusive,
    Shared(usize),
    Closed(String),
}

struct LockState {
    status: LockStatus,
    exclusive_waiters: VecDeque<ExclusiveWaiter>,
    shared_waiters: Vec<SharedWaiter>,
}

/// Waiters to resume once the state mutex is released.
#[derive(Default)]
struct Wakeups {
    exclusive: Option<ExclusiveWaiter>,
    shared: Vec<SharedWaiter>,
    disposed: Option<(String, Vec<ExclusiveWaiter>, Vec<SharedWaiter>)>,
}

impl LockState {
    /// Move the lock from `Idle` to whoever is entitled to it.
    fn hand_off(&mut self, wakeups: &mut Wakeups) {
        debug_assert_eq!(self.status, LockStatus::Idle);
        if let Some(waiter) = self.next_exclusive() {
            self.status = LockStatus::Exclusive;
            wakeups.exclusive = Some(waiter);
        } else {
            self.grant_shared_waiters(0, wakeups);
        }
    }

    fn next_exclusive(&mut self) -> Option<ExclusiveWaiter> {
        while let Some(waiter) = self.exclusive_waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    /// Grant every queued shared waiter on top of `held` existing holders.
    fn grant_shared_waiters(&mut self, held: usize, wakeups: &mut Wakeups) {
        let mut waiters = std::mem::take(&mut self.shared_waiters);
        waiters.retain(|w| !w.is_closed());
        let count = held + waiters.len();
        self.status = if count == 0 {
            LockStatus::Idle
        } else {
            LockStatus::Shared(count)
        };
        wakeups.shared = waiters;
    }
}

/// The session-wide command lock. Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct CommandLock {
    state: Arc<Mutex<LockState>>,
}

impl Default for CommandLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLock")
            .field("status", &self.status())
            .finish()
    }
}

impl CommandLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                status: LockStatus::Idle,
                exclusive_waiters: VecDeque::new(),
                shared_waiters: Vec::new(),
            })),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> LockStatus {
        self.lock_state().status.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.lock_state().status, LockStatus::Closed(_))
    }

    /// Number of callers suspended in an acquire.
    #[must_use]
    pub fn waiting(&self) -> usize {
        let state = self.lock_state();
        state.exclusive_waiters.len() + state.shared_waiters.len()
    }

    /// Acquire the lock exclusively, waiting behind any current holder.
    ///
    /// The returned token holds the lock until it is closed, converted or
    /// dropped.
    ///
    /// # Errors
    /// Returns error if the lock is closed, or gets closed while waiting.
    pub async fn acquire_exclusive(&self) -> Result<ExclusiveToken, LockError> {
        let waiter = {
            let mut state = self.lock_state();
            match &state.status {
                LockStatus::Closed(message) => return Err(LockError::Disposed(message.clone())),
                LockStatus::Idle => {
                    state.status = LockStatus::Exclusive;
                    return Ok(ExclusiveToken::new(self.clone()));
                }
                LockStatus::Exclusive | LockStatus::Shared(_) => {
                    let (tx, rx) = oneshot::channel();
                    state.exclusive_waiters.push_back(tx);
                    rx
                }
            }
        };
        waiter
            .await
            .unwrap_or_else(|_| Err(LockError::Disposed("command lock dropped".to_string())))
    }

    /// Acquire the lock shared, waiting only while it is held exclusively.
    ///
    /// # Errors
    /// Returns error if the lock is closed, or gets closed while waiting.
    pub async fn acquire_shared(&self) -> Result<SharedLockGuard, LockError> {
        let waiter = {
            let mut state = self.lock_state();
            match &state.status {
                LockStatus::Closed(message) => return Err(LockError::Disposed(message.clone())),
                LockStatus::Idle => {
                    state.status = LockStatus::Shared(1);
                    return Ok(SharedLockGuard::new(self.clone()));
                }
                LockStatus::Shared(n) => {
                    state.status = LockStatus::Shared(n + 1);
                    return Ok(SharedLockGuard::new(self.clone()));
                }
                LockStatus::Exclusive => {
                    let (tx, rx) = oneshot::channel();
                    state.shared_waiters.push(tx);
                    rx
                }
            }
        };
        waiter
            .await
            .unwrap_or_else(|_| Err(LockError::Disposed("command lock dropped".to_string())))
    }

    /// Permanently close the lock. Every suspended acquire fails with
    /// `message`, as does every later one.
    pub fn close(&self, message: impl Into<String>) {
        let message = message.into();
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            if matches!(state.status, LockStatus::Closed(_)) {
                return;
            }
            tracing::debug!(%message, "Closing command lock");
            state.status = LockStatus::Closed(message.clone());
            wakeups.disposed = Some((
                message,
                state.exclusive_waiters.drain(..).collect(),
                std::mem::take(&mut state.shared_waiters),
            ));
        }
        self.wake(wakeups);
    }

    fn release_exclusive(&self) {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            if state.status != LockStatus::Exclusive {
                return;
            }
            if state.shared_waiters.iter().any(|w| !w.is_closed()) {
                state.grant_shared_waiters(0, &mut wakeups);
            } else {
                state.status = LockStatus::Idle;
                state.hand_off(&mut wakeups);
            }
        }
        self.wake(wakeups);
    }

    fn convert_exclusive(&self) -> bool {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            if state.status != LockStatus::Exclusive {
                return false;
            }
            state.grant_shared_waiters(1, &mut wakeups);
        }
        self.wake(wakeups);
        true
    }

    fn release_shared(&self) {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.lock_state();
            match state.status {
                LockStatus::Shared(1) => {
                    state.status = LockStatus::Idle;
                    state.hand_off(&mut wakeups);
                }
                LockStatus::Shared(n) => state.status = LockStatus::Shared(n - 1),
                _ => return,
            }
        }
        self.wake(wakeups);
    }

    /// Resume waiters. Runs without the state mutex: a waiter that went away
    /// hands back its token or guard, whose drop re-enters the lock.
    fn wake(&self, wakeups: Wakeups) {
        if let Some(waiter) = wakeups.exclusive {
            let _ = waiter.send(Ok(ExclusiveToken::new(self.clone())));
        }
        for waiter in wakeups.shared {
            let _ = waiter.send(Ok(SharedLockGuard::new(self.clone())));
        }
        if let Some((message, exclusive, shared)) = wakeups.disposed {
            for waiter in exclusive {
                let _ = waiter.send(Err(LockError::Disposed(message.clone())));
            }
            for waiter in shared {
                let _ = waiter.send(Err(LockError::Disposed(message.clone())));
            }
        }
    }
}

/// Proof of holding the lock exclusively.
///
/// Closing (or dropping) releases it; converting downgrades it to a shared
/// hold with no window in which another exclusive acquirer could slip in.
/// Both are idempotent: afterwards the token reports itself closed.
#[must_use = "the exclusive lock is released when the token is dropped"]
pub struct ExclusiveToken {
    lock: Option<CommandLock>,
}

impl ExclusiveToken {
    const fn new(lock: CommandLock) -> Self {
        Self { lock: Some(lock) }
    }

    /// Release the exclusive hold.
    pub fn close(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release_exclusive();
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.lock.is_none()
    }

    /// Downgrade to a shared hold, granting queued shared waiters with it.
    ///
    /// `None` if the token was already closed or the lock has been closed.
    pub fn convert_to_shared(&mut self) -> Option<SharedLockGuard> {
        let lock = self.lock.take()?;
        lock.convert_exclusive().then(|| SharedLockGuard::new(lock))
    }

    /// True if both tokens refer to the same lock.
    #[must_use]
    pub fn belongs_to(&self, lock: &CommandLock) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|l| Arc::ptr_eq(&l.state, &lock.state))
    }
}

impl fmt::Debug for ExclusiveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveToken")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ExclusiveToken {
    fn drop(&mut self) {
        self.close();
    }
}

/// One shared hold, released on drop.
#[must_use = "the shared lock is released when the guard is dropped"]
pub struct SharedLockGuard {
    lock: Option<CommandLock>,
}

impl SharedLockGuard {
    const fn new(lock: CommandLock) -> Self {
        Self { lock: Some(lock) }
    }

    /// Release the shared hold.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release_shared();
        }
    }
}

impl fmt::Debug for SharedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLockGuard").finish_non_exhaustive()
    }
}

impl Drop for SharedLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
