//! Fan-out of out-of-band records to session subscribers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use mi_core::{ParseError, Record};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Something the backend said that no command was waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Async, stream and raw records, plus untokenized results nobody claimed.
    Record(Record),
    Stderr(String),
    /// A stdout line that could not be parsed.
    Malformed { line: String, error: ParseError },
    /// Always the last event of a session.
    Disconnected {
        exit_code: Option<i32>,
        reason: Option<String>,
    },
}

struct Inner {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    /// Set once the session ended; replayed to late subscribers.
    closed: Option<SessionEvent>,
}

/// Ordered delivery to every subscriber.
///
/// All events come from the session's single reader task, so every
/// subscriber sees them in arrival order.
pub struct EventHub {
    inner: Mutex<Inner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                closed: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream of every event published from now on.
    ///
    /// After the session closed the stream yields the final `Disconnected`
    /// event and ends.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiverStream<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner();
        match &inner.closed {
            Some(last) => {
                let _ = tx.send(last.clone());
            }
            None => inner.subscribers.push(tx),
        }
        UnboundedReceiverStream::new(rx)
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut inner = self.inner();
        if inner.closed.is_some() {
            return;
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Publish the final event and end every subscriber stream.
    pub fn close(&self, last: SessionEvent) {
        let mut inner = self.inner();
        if inner.closed.is_some() {
            return;
        }
        for subscriber in inner.subscribers.drain(..) {
            let _ = subscriber.send(last.clone());
        }
        inner.closed = Some(last);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn disconnected() -> SessionEvent {
        SessionEvent::Disconnected {
            exit_code: Some(0),
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_events_in_order_then_end() {
        let hub = EventHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(SessionEvent::Record(Record::ConsoleStream("a".into())));
        hub.publish(SessionEvent::Stderr("b".into()));
        hub.close(disconnected());

        for stream in [&mut first, &mut second] {
            assert_eq!(
                stream.next().await,
                Some(SessionEvent::Record(Record::ConsoleStream("a".into())))
            );
            assert_eq!(stream.next().await, Some(SessionEvent::Stderr("b".into())));
            assert_eq!(stream.next().await, Some(disconnected()));
            assert_eq!(stream.next().await, None);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_removed() {
        let hub = EventHub::new();
        let dropped = hub.subscribe();
        let _kept = hub.subscribe();
        drop(dropped);
        hub.publish(SessionEvent::Stderr("x".into()));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_close() {
        let hub = EventHub::new();
        hub.close(disconnected());
        hub.publish(SessionEvent::Stderr("late".into()));

        let mut stream = hub.subscribe();
        assert_eq!(stream.next().await, Some(disconnected()));
        assert_eq!(stream.next().await, None);
    }
}
