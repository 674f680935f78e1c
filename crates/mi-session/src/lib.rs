//! Command serialization and result dispatch for MI debugger sessions.
//!
//! Provides:
//! - `CommandLock` - Exclusive/shared lock with FIFO hand-off
//! - `Session` - Tokenized command dispatch over a transport
//! - `SessionEvent` - Ordered out-of-band records for subscribers

pub mod error;
pub mod events;
pub mod lock;
pub mod pending;
pub mod session;

pub use error::{LockError, SessionError};
pub use events::{EventHub, SessionEvent};
pub use lock::{CommandLock, ExclusiveToken, LockStatus, SharedLockGuard};
pub use session::{Command, DEFAULT_FIRST_TOKEN, LockKind, Response, Session, SessionOptions};
