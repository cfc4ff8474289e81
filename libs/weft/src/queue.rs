// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// FIFO multi-producer/multi-consumer queue of ready work.
///
/// One mutex, two condition variables: `pop_wake` signals consumers when an
/// item arrives, `push_wake` signals producers when a bounded queue drains.
/// The engine runs it unbounded; the bound exists for pipeline-style use.
///
/// Closing the queue turns blocked pops into a drain: remaining items are
/// still handed out, after which pop returns the `None` sentinel.
pub(crate) struct WorkQueue<T> {
    state: Mutex<State<T>>,
    pop_wake: Condvar,
    push_wake: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    bound: Option<usize>,
    closed: bool,
}

/// Result of a non-blocking pop attempt.
pub(crate) enum TryPop<T> {
    Item(T),
    Empty,
    Closed,
}

// === impl WorkQueue ===

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        Self::with_bound(None)
    }

    pub(crate) fn with_bound(bound: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                bound,
                closed: false,
            }),
            pop_wake: Condvar::new(),
            push_wake: Condvar::new(),
        }
    }

    /// Appends an item. Blocks only when a bound is set and reached.
    ///
    /// # Panics
    ///
    /// Panics when the queue has been closed; scheduling work after the
    /// engine has drained is a contract violation.
    pub(crate) fn push(&self, item: T) {
        let mut state = self.state.lock();
        while state
            .bound
            .is_some_and(|bound| state.items.len() >= bound && !state.closed)
        {
            self.push_wake.wait(&mut state);
        }
        assert!(!state.closed, "pushed to a closed work queue");
        state.items.push_back(item);
        drop(state);
        self.pop_wake.notify_one();
    }

    /// Removes the head without blocking.
    pub(crate) fn try_pop(&self) -> TryPop<T> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                self.push_wake.notify_one();
                TryPop::Item(item)
            }
            None if state.closed => TryPop::Closed,
            None => TryPop::Empty,
        }
    }

    /// Removes the head, blocking until an item is available. Returns `None`
    /// once the queue is closed and drained.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.push_wake.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.pop_wake.wait(&mut state);
        }
    }

    /// Closes the queue and wakes every blocked producer and consumer.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.pop_wake.notify_all();
        self.push_wake.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fifo_order() {
        let queue = WorkQueue::new();
        for i in 0..64 {
            queue.push(i);
        }
        for i in 0..64 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn close_drains_then_signals() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.close();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn blocked_pop_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(10));
        queue.push(42);
        assert_eq!(popper.join().unwrap(), Some(42));
    }

    #[test]
    fn blocked_pop_wakes_on_close() {
        let queue = Arc::new(WorkQueue::<u8>::new());
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(10));
        queue.close();
        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn bounded_push_blocks_until_pop() {
        let queue = Arc::new(WorkQueue::with_bound(Some(1)));
        queue.push(1);
        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.pop(), Some(1));
        pusher.join().unwrap();
        assert_eq!(queue.pop(), Some(2));
    }
}
