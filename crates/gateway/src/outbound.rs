//! Bounded per-connection send queue.
//!
//! Backpressure policy: the queue is capped by message count and byte size,
//! whichever trips first. An overflowing publish drops the oldest
//! non-critical queued frame and marks the connection; a second drop within
//! the window closes it as a slow consumer. Critical frames are never
//! dropped: if one cannot be queued the connection is promoted to close
//! instead.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Two drops inside this window close the connection.
const DROP_WINDOW_MS: i64 = 10_000;
const DROPS_TO_CLOSE: usize = 2;

/// Why a queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Backpressure policy tripped.
    SlowConsumer,
    /// Normal teardown.
    Gone,
}

/// What a push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, but an older non-critical frame was evicted.
    DroppedOldest,
    /// The queue is closing; the frame was not accepted.
    Closing,
}

/// One serialized outbound frame.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub json: String,
    pub critical: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    frames: VecDeque<QueuedFrame>,
    bytes: usize,
    closed: Option<CloseReason>,
    /// Timestamps of recent overflow drops.
    drops: VecDeque<i64>,
}

/// Bounded FIFO between publishers and one connection's writer task.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_messages: usize,
    max_bytes: usize,
}

impl SendQueue {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            max_messages: max_messages.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Enqueue a frame under the backpressure policy.
    pub fn push(&self, json: String, critical: bool, now_ms: i64) -> PushOutcome {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.closed.is_some() {
            return PushOutcome::Closing;
        }

        let mut outcome = PushOutcome::Queued;
        while inner.frames.len() >= self.max_messages
            || inner.bytes + json.len() > self.max_bytes
        {
            // Evict the oldest non-critical frame.
            let victim = inner.frames.iter().position(|f| !f.critical);
            match victim {
                Some(index) => {
                    let dropped = inner.frames.remove(index).expect("index in range");
                    inner.bytes -= dropped.json.len();
                    outcome = PushOutcome::DroppedOldest;

                    inner.drops.push_back(now_ms);
                    while let Some(&front) = inner.drops.front() {
                        if now_ms - front > DROP_WINDOW_MS {
                            inner.drops.pop_front();
                        } else {
                            break;
                        }
                    }
                    if inner.drops.len() >= DROPS_TO_CLOSE {
                        inner.closed = Some(CloseReason::SlowConsumer);
                        self.notify.notify_one();
                        return PushOutcome::Closing;
                    }
                }
                None => {
                    // Nothing droppable: the subscriber cannot keep up with
                    // critical traffic.
                    inner.closed = Some(CloseReason::SlowConsumer);
                    self.notify.notify_one();
                    return PushOutcome::Closing;
                }
            }
        }

        inner.bytes += json.len();
        inner.frames.push_back(QueuedFrame { json, critical });
        self.notify.notify_one();
        outcome
    }

    /// Drain everything queued, in order.
    pub fn pop_all(&self) -> Vec<QueuedFrame> {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.bytes = 0;
        inner.frames.drain(..).collect()
    }

    pub fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.closed.is_none() {
            inner.closed = Some(reason);
        }
        self.notify.notify_one();
    }

    pub fn closed(&self) -> Option<CloseReason> {
        self.inner.lock().expect("queue lock").closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until new frames arrive or the queue closes.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> String {
        format!("{{\"n\":{}}}", n)
    }

    #[test]
    fn test_fifo_order() {
        let queue = SendQueue::new(16, 1 << 20);
        for n in 0..5 {
            assert_eq!(queue.push(frame(n), false, 0), PushOutcome::Queued);
        }
        let drained: Vec<String> = queue.pop_all().into_iter().map(|f| f.json).collect();
        assert_eq!(drained, (0..5).map(frame).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest_non_critical() {
        let queue = SendQueue::new(3, 1 << 20);
        queue.push(frame(0), false, 0);
        queue.push(frame(1), true, 0);
        queue.push(frame(2), false, 0);

        // Full: the oldest non-critical frame (0) is evicted.
        assert_eq!(queue.push(frame(3), false, 100), PushOutcome::DroppedOldest);

        let kept: Vec<String> = queue.pop_all().into_iter().map(|f| f.json).collect();
        assert_eq!(kept, vec![frame(1), frame(2), frame(3)]);
    }

    #[test]
    fn test_two_drops_in_window_close_the_queue() {
        let queue = SendQueue::new(2, 1 << 20);
        queue.push(frame(0), false, 0);
        queue.push(frame(1), false, 0);

        assert_eq!(queue.push(frame(2), false, 1_000), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(frame(3), false, 2_000), PushOutcome::Closing);
        assert_eq!(queue.closed(), Some(CloseReason::SlowConsumer));
    }

    #[test]
    fn test_drops_outside_window_do_not_accumulate() {
        let queue = SendQueue::new(2, 1 << 20);
        queue.push(frame(0), false, 0);
        queue.push(frame(1), false, 0);

        assert_eq!(queue.push(frame(2), false, 1_000), PushOutcome::DroppedOldest);
        // 11 s later: the first drop has aged out of the window.
        assert_eq!(
            queue.push(frame(3), false, 12_000),
            PushOutcome::DroppedOldest
        );
        assert!(queue.closed().is_none());
    }

    #[test]
    fn test_critical_overflow_promotes_to_close() {
        let queue = SendQueue::new(2, 1 << 20);
        queue.push(frame(0), true, 0);
        queue.push(frame(1), true, 0);

        // Queue is all-critical and full: a further critical frame cannot
        // evict anything, so the connection must close.
        assert_eq!(queue.push(frame(2), true, 100), PushOutcome::Closing);
        assert_eq!(queue.closed(), Some(CloseReason::SlowConsumer));
    }

    #[test]
    fn test_byte_cap() {
        let queue = SendQueue::new(1_000, 20);
        queue.push("x".repeat(15), false, 0);
        assert_eq!(queue.push("y".repeat(15), false, 0), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = SendQueue::new(4, 1 << 20);
        queue.close(CloseReason::Gone);
        assert_eq!(queue.push(frame(0), false, 0), PushOutcome::Closing);
    }
}
