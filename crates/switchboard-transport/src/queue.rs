//! Completion queues: the event spine between the transport and workers.
//!
//! Every transport operation a server issues carries an opaque tag; when
//! the operation completes, the transport posts `(tag, ok)` onto the
//! completion queue the operation was issued against. Worker threads drain
//! their queue and demultiplex events back to the owning call state machine.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Opaque completion tag identifying the call state machine that issued
/// an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

/// Outcome of waiting on a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqNext {
    /// An operation completed. `ok` is the transport's success flag.
    Event {
        /// Tag of the completed operation.
        tag: Tag,
        /// Whether the operation succeeded.
        ok: bool,
    },
    /// The wait timed out with no event.
    TimedOut,
    /// The queue is shut down and fully drained.
    Shutdown,
}

#[derive(Debug, Default)]
struct QueueInner {
    events: VecDeque<(Tag, bool)>,
    shut_down: bool,
}

/// A FIFO of "operation completed" events with blocking wait.
///
/// Producers are transport-side operation completions; the single consumer
/// is the worker thread owning the queue. Events posted after shutdown are
/// retained so the consumer can drain them before exiting.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl CompletionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a completion event.
    pub fn post(&self, tag: Tag, ok: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.push_back((tag, ok));
        self.ready.notify_one();
    }

    /// Waits up to `timeout` for the next event.
    pub fn next(&self, timeout: Duration) -> CqNext {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some((tag, ok)) = inner.events.pop_front() {
                return CqNext::Event { tag, ok };
            }
            if inner.shut_down {
                return CqNext::Shutdown;
            }
            let (guard, result) = self
                .ready
                .wait_timeout(inner, timeout)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
            if result.timed_out() {
                return match inner.events.pop_front() {
                    Some((tag, ok)) => CqNext::Event { tag, ok },
                    None if inner.shut_down => CqNext::Shutdown,
                    None => CqNext::TimedOut,
                };
            }
        }
    }

    /// Pops an event without blocking. Used to drain after shutdown.
    pub fn try_next(&self) -> Option<(Tag, bool)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.pop_front()
    }

    /// Marks the queue shut down and wakes any waiter.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.shut_down = true;
        self.ready.notify_all();
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .len()
    }

    /// Returns `true` when no events are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
