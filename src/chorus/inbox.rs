//! A bounded, peekable FIFO queue of [`Event`]s for a single principal.
//!
//! `tokio::sync::mpsc` gets close to this but doesn't expose a
//! non-destructive peek, which `AgentContext::list_inbox` needs, so the
//! queue itself is hand-rolled on top of a `Mutex<VecDeque<_>>` and two
//! `Notify`s (one to wake waiting consumers, one to wake blocked producers).

use crate::event::Event;
use crate::message::ErrorKind;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Error returned when an event cannot be delivered to an inbox.
#[derive(Debug, Clone)]
pub struct InboxError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InboxError {
    fn full() -> Self {
        Self {
            kind: ErrorKind::InboxFull,
            message: "inbox did not free capacity within the backpressure window".to_string(),
        }
    }

    fn closed() -> Self {
        Self {
            kind: ErrorKind::UnknownIdentifier,
            message: "inbox has been unregistered".to_string(),
        }
    }
}

impl std::fmt::Display for InboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for InboxError {}

struct Inner {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    closed: AtomicBool,
    has_items: Notify,
    has_space: Notify,
}

/// A cloneable handle to a bounded inbox. Clones share the same underlying
/// queue; the router holds one to enqueue, the owning agent or team-service
/// runtime holds another to consume.
#[derive(Clone)]
pub struct Inbox {
    inner: Arc<Inner>,
}

impl Inbox {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                capacity,
                closed: AtomicBool::new(false),
                has_items: Notify::new(),
                has_space: Notify::new(),
            }),
        }
    }

    /// Enqueue, blocking up to `timeout` for room to free up. Returns
    /// `InboxError::InboxFull` if the window elapses first.
    pub async fn enqueue(&self, event: Event, timeout: Duration) -> Result<(), InboxError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(InboxError::closed());
            }
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if queue.len() < self.inner.capacity {
                    queue.push_back(event);
                    self.inner.has_items.notify_one();
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(InboxError::full());
            }
            let _ = tokio::time::timeout(remaining, self.inner.has_space.notified()).await;
        }
    }

    /// Enqueue without waiting; fails immediately if the inbox is full or
    /// closed. Used by channel fan-out, which must not let one slow member
    /// stall delivery to the rest.
    pub fn try_enqueue(&self, event: Event) -> Result<(), InboxError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(InboxError::closed());
        }
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.capacity {
            return Err(InboxError::full());
        }
        queue.push_back(event);
        self.inner.has_items.notify_one();
        Ok(())
    }

    /// Pop the oldest event without blocking.
    pub fn try_recv(&self) -> Option<Event> {
        let mut queue = self.inner.queue.lock().unwrap();
        let event = queue.pop_front();
        if event.is_some() {
            self.inner.has_space.notify_one();
        }
        event
    }

    /// Pop the oldest event, waiting if the queue is empty. Returns `None`
    /// once the inbox is closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.has_items.notified().await;
        }
    }

    /// Non-destructive snapshot of everything currently queued, oldest
    /// first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.queue.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the inbox closed: pending `recv`/`enqueue` calls are released.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.has_items.notify_waiters();
        self.inner.has_space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use crate::message::{Message, Role};

    fn sample_event() -> Event {
        Event::Message(Message::direct(
            Identifier::agent("a"),
            Identifier::agent("b"),
            "hi",
            Role::Agent,
        ))
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let inbox = Inbox::bounded(4);
        for i in 0..3 {
            inbox
                .enqueue(
                    Event::Message(Message::direct(
                        Identifier::agent("a"),
                        Identifier::agent("b"),
                        i.to_string(),
                        Role::Agent,
                    )),
                    Duration::from_millis(50),
                )
                .await
                .unwrap();
        }
        for i in 0..3 {
            let event = inbox.recv().await.unwrap();
            assert_eq!(event.as_message().unwrap().content.as_ref(), i.to_string());
        }
    }

    #[tokio::test]
    async fn full_inbox_times_out() {
        let inbox = Inbox::bounded(1);
        inbox.try_enqueue(sample_event()).unwrap();
        let result = inbox.enqueue(sample_event(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(e) if matches!(e.kind, ErrorKind::InboxFull)));
    }

    #[tokio::test]
    async fn closing_releases_blocked_recv() {
        let inbox = Inbox::bounded(4);
        let consumer = inbox.clone();
        let handle = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[test]
    fn snapshot_does_not_consume() {
        let inbox = Inbox::bounded(4);
        inbox.try_enqueue(sample_event()).unwrap();
        assert_eq!(inbox.snapshot().len(), 1);
        assert_eq!(inbox.len(), 1);
    }
}
