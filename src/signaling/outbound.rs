#![forbid(unsafe_code)]

// Bounded per-connection send queue with a drop-oldest overflow policy.
//
// Producers (broadcasts, relays, the connection's own replies) never wait: when
// the queue is full the oldest pending frame is discarded. Delivery to a slow
// consumer is therefore best-effort. The single consumer is the write task.

use super::protocol::ServerEvent;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

/// Pre-serialized JSON frame, shared between all recipients of a broadcast.
pub type Frame = Arc<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued after discarding the oldest pending frame
    DisplacedOldest,
    /// Queue closed, or the event could not be encoded
    Discarded,
}

struct State {
    frames: VecDeque<Frame>,
    closed: bool,
    dropped: u64,
}

struct Inner {
    state: StdMutex<State>,
    ready: Notify,
    capacity: usize,
}

#[derive(Clone)]
pub struct Outbound {
    inner: Arc<Inner>,
}

impl Outbound {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(State {
                    frames: VecDeque::with_capacity(capacity),
                    closed: false,
                    dropped: 0,
                }),
                ready: Notify::new(),
                capacity,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, frame: Frame) -> Enqueued {
        let outcome = {
            let mut state = self.state();
            if state.closed {
                return Enqueued::Discarded;
            }
            let outcome = if state.frames.len() >= self.inner.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                Enqueued::DisplacedOldest
            } else {
                Enqueued::Queued
            };
            state.frames.push_back(frame);
            outcome
        };
        self.inner.ready.notify_one();
        outcome
    }

    pub fn send_event(&self, event: &ServerEvent) -> Enqueued {
        match event.encode() {
            Some(frame) => self.push(frame),
            None => Enqueued::Discarded,
        }
    }

    pub fn try_recv(&self) -> Option<Frame> {
        self.state().frames.pop_front()
    }

    /// Waits for the next frame. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            let notified = self.inner.ready.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
            }
            notified.await;
        }
    }

    /// Closes the queue and releases pending frames. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            let pending = state.frames.len();
            state.frames.clear();
            if pending > 0 {
                warn!("Outbound queue closed with {} undelivered frame(s)", pending);
            }
        }
        self.inner.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(s: &str) -> Frame {
        Arc::new(s.to_string())
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = Outbound::new(2);
        assert_eq!(queue.push(frame("a")), Enqueued::Queued);
        assert_eq!(queue.push(frame("b")), Enqueued::Queued);
        assert_eq!(queue.push(frame("c")), Enqueued::DisplacedOldest);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_recv().as_deref().map(String::as_str), Some("b"));
        assert_eq!(queue.try_recv().as_deref().map(String::as_str), Some("c"));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_closed_queue_discards_and_releases() {
        let queue = Outbound::new(4);
        queue.push(frame("pending"));
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert_eq!(queue.push(frame("late")), Enqueued::Discarded);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Outbound::new(4);
        let consumer = queue.clone();
        let task = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(frame("hello"));
        let got = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(got.as_deref().map(String::as_str), Some("hello"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let queue = Outbound::new(4);
        let consumer = queue.clone();
        let task = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        let got = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(got.is_none());
    }
}
