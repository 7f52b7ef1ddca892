//! Fixed-capacity blocking FIFO used for every producer/consumer hand-off.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A synchronized ring of at most `capacity` items.
///
/// Full and empty are not errors: `push` and `pop` wait. `close` is the
/// cancellation hook and wakes every waiter.
pub struct BoundedBuffer<T> {
    inner: Mutex<BufferState<T>>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

struct BufferState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedBuffer<T> {
    /// Create an empty buffer. A zero capacity is bumped to one so `push`
    /// can always make progress.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(BufferState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    /// Block while full, then append. Returns the item if the buffer is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        loop {
            if guard.closed {
                return Err(item);
            }
            if guard.items.len() < self.capacity {
                break;
            }
            guard = self.writable.wait(guard).expect("condvar wait failed");
        }
        guard.items.push_back(item);
        // remove_matching waiters may decline the new item, so wake them all.
        self.readable.notify_all();
        Ok(())
    }

    /// Append without waiting; hands the item back when full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        if guard.closed || guard.items.len() >= self.capacity {
            return Err(item);
        }
        guard.items.push_back(item);
        self.readable.notify_all();
        Ok(())
    }

    /// Block until an item is available. Returns `None` once the buffer is
    /// closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.writable.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            guard = self.readable.wait(guard).expect("condvar wait failed");
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        let item = guard.items.pop_front();
        if item.is_some() {
            self.writable.notify_one();
        }
        item
    }

    /// Remove the first item satisfying `predicate`, waiting for new data
    /// until one shows up. Returns `None` only when the buffer is closed.
    pub fn remove_matching<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        loop {
            if let Some(index) = guard.items.iter().position(&mut predicate) {
                let item = guard.items.remove(index);
                self.writable.notify_one();
                return item;
            }
            if guard.closed {
                return None;
            }
            guard = self.readable.wait(guard).expect("condvar wait failed");
        }
    }

    /// [`remove_matching`](Self::remove_matching) that gives up after
    /// `timeout`. `None` means either no match in time or a closed buffer;
    /// [`is_closed`](Self::is_closed) tells them apart.
    pub fn remove_matching_timeout<F>(&self, mut predicate: F, timeout: Duration) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        loop {
            if let Some(index) = guard.items.iter().position(&mut predicate) {
                let item = guard.items.remove(index);
                self.writable.notify_one();
                return item;
            }
            let now = Instant::now();
            if guard.closed || now >= deadline {
                return None;
            }
            guard = self
                .readable
                .wait_timeout(guard, deadline - now)
                .expect("condvar wait failed")
                .0;
        }
    }

    /// Take everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        let items: Vec<T> = guard.items.drain(..).collect();
        self.writable.notify_all();
        items
    }

    /// Close the buffer and wake all blocked producers and consumers.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("buffer mutex poisoned");
        guard.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("buffer mutex poisoned").closed
    }

    /// Current number of buffered items.
    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("buffer mutex poisoned");
        guard.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
