//! Bounded single-producer/single-consumer pipe.
//!
//! Connects a producer thread to a consumer that is re-entered from an
//! event loop. `push` blocks while the pipe is full, `pop` while it is
//! empty; closing the pipe wakes both ends, after which `push` is a no-op
//! and `pop` drains the remaining items before reporting termination.
//! A pipe is never reopened. The consumer unblocks a stuck producer by
//! `clear` followed by `close`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct PipeState<T> {
    items: VecDeque<T>,
    open: bool,
}

/// Bounded FIFO with blocking push/pop and a "no more items" latch.
pub struct BoundedPipe<T> {
    state: Mutex<PipeState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedPipe<T> {
    /// Creates a pipe holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PipeState {
                items: VecDeque::new(),
                open: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends an item, blocking while the pipe is full. Returns `false`
    /// when the pipe is closed and the item was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut state = lock(&self.state);
        while state.items.len() == self.capacity && state.open {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        if !state.open {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Removes the oldest item, blocking while the pipe is empty and open.
    /// `None` means the pipe is closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = lock(&self.state);
        while state.items.is_empty() && state.open {
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Latches "no more items" and wakes both ends. Idempotent; a closed
    /// pipe is never reopened.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.open = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Discards all buffered items, waking a blocked producer.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.items.clear();
        self.not_full.notify_all();
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    /// Returns `true` when no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the pipe is still open.
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let pipe = BoundedPipe::new(4);
        assert!(pipe.push(1));
        assert!(pipe.push(2));
        assert!(pipe.push(3));
        assert_eq!(pipe.pop(), Some(1));
        assert_eq!(pipe.pop(), Some(2));
        assert_eq!(pipe.pop(), Some(3));
    }

    #[test]
    fn test_close_then_drain_then_terminated() {
        let pipe = BoundedPipe::new(4);
        pipe.push(10);
        pipe.push(20);
        pipe.close();
        assert_eq!(pipe.pop(), Some(10));
        assert_eq!(pipe.pop(), Some(20));
        assert_eq!(pipe.pop(), None);
        assert_eq!(pipe.pop(), None);
    }

    #[test]
    fn test_push_after_close_is_noop() {
        let pipe = BoundedPipe::new(2);
        pipe.close();
        assert!(!pipe.push(1));
        assert!(pipe.is_empty());
    }

    #[test]
    fn test_capacity_one_producer_blocks() {
        let pipe = Arc::new(BoundedPipe::new(1));
        let pushed = Arc::new(AtomicUsize::new(0));
        let producer = {
            let pipe = pipe.clone();
            let pushed = pushed.clone();
            std::thread::spawn(move || {
                for i in 0..3 {
                    assert!(pipe.push(i));
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        // The producer gets exactly one item in before blocking.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.pop(), Some(0));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 2);
        assert_eq!(pipe.pop(), Some(1));
        assert_eq!(pipe.pop(), Some(2));
        producer.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_unblocks_producer() {
        let pipe = Arc::new(BoundedPipe::new(1));
        assert!(pipe.push(0));
        let producer = {
            let pipe = pipe.clone();
            std::thread::spawn(move || pipe.push(1))
        };
        std::thread::sleep(Duration::from_millis(30));
        pipe.clear();
        pipe.close();
        // The producer either slipped its item in before the close or
        // observed the closed pipe; it must not stay blocked.
        producer.join().unwrap();
        assert!(!pipe.is_open());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let pipe = Arc::new(BoundedPipe::new(2));
        let consumer = {
            let pipe = pipe.clone();
            std::thread::spawn(move || pipe.pop())
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(pipe.push(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let pipe: BoundedPipe<u8> = BoundedPipe::new(0);
        assert_eq!(pipe.capacity(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The pipe never buffers more than its capacity, and a
            // producer/consumer pair moves every item through in order.
            #[test]
            fn prop_capacity_never_exceeded(
                capacity in 1usize..8,
                items in proptest::collection::vec(any::<u16>(), 0..64),
            ) {
                let pipe = Arc::new(BoundedPipe::new(capacity));
                let expected = items.clone();
                let producer = {
                    let pipe = pipe.clone();
                    std::thread::spawn(move || {
                        for item in items {
                            assert!(pipe.push(item));
                        }
                        pipe.close();
                    })
                };
                let mut received = Vec::new();
                loop {
                    prop_assert!(pipe.len() <= capacity);
                    match pipe.pop() {
                        Some(item) => received.push(item),
                        None => break,
                    }
                }
                producer.join().unwrap();
                prop_assert_eq!(received, expected);
            }
        }
    }
}
