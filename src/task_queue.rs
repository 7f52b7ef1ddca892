//! Thread-safe priority queue of fires awaiting a unit.
//!
//! Fires are ordered by severity rank, then by arrival, so equal
//! severities are dispatched first-come first-served.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use crate::types::{FireEvent, TaskId};

/// Bounded, synchronized priority queue of pending fires.
pub struct TaskQueue {
    inner: Mutex<TaskQueueState>,
    available: Condvar,
    space: Condvar,
    capacity: usize,
}

struct TaskQueueState {
    heap: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
    closed: bool,
}

struct Pending {
    rank: u8,
    seq: u64,
    task: FireEvent,
}

impl Pending {
    fn key(&self) -> (u8, u64) {
        (self.rank, self.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl TaskQueue {
    /// Create an empty queue holding at most `capacity` fires.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TaskQueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
            space: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a fire, waiting while the queue is full. Returns the fire
    /// back if the queue is closed.
    pub fn push(&self, task: FireEvent) -> Result<(), FireEvent> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        loop {
            if guard.closed {
                return Err(task);
            }
            if guard.heap.len() < self.capacity {
                break;
            }
            guard = self.space.wait(guard).expect("condvar wait failed");
        }
        Self::insert(&mut guard, task);
        self.available.notify_one();
        Ok(())
    }

    fn insert(state: &mut TaskQueueState, task: FireEvent) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Pending {
            rank: task.severity.rank(),
            seq,
            task,
        }));
    }

    /// Insert without waiting; hands the fire back when full or closed.
    pub fn try_push(&self, task: FireEvent) -> Result<(), FireEvent> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        if guard.closed || guard.heap.len() >= self.capacity {
            return Err(task);
        }
        Self::insert(&mut guard, task);
        self.available.notify_one();
        Ok(())
    }

    /// Try to pop the highest-priority fire without blocking.
    pub fn try_pop(&self) -> Option<FireEvent> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        let task = guard.heap.pop().map(|Reverse(pending)| pending.task);
        if task.is_some() {
            self.space.notify_one();
        }
        task
    }

    /// Block until a fire is available or the queue is closed.
    pub fn pop_blocking_or_closed(&self) -> Option<FireEvent> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        loop {
            if let Some(Reverse(pending)) = guard.heap.pop() {
                self.space.notify_one();
                return Some(pending.task);
            }
            if guard.closed {
                return None;
            }
            // Wait releases the lock and re-acquires it before returning.
            guard = self.available.wait(guard).expect("condvar wait failed");
        }
    }

    /// Close the queue and wake all blocked producers and consumers.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.closed = true;
        self.available.notify_all();
        self.space.notify_all();
    }

    /// Ids in the order they would be dispatched.
    pub fn dispatch_order(&self) -> Vec<TaskId> {
        let guard = self.inner.lock().expect("task queue mutex poisoned");
        let mut pending: Vec<&Pending> = guard.heap.iter().map(|Reverse(p)| p).collect();
        pending.sort();
        pending.into_iter().map(|p| p.task.id).collect()
    }

    /// Current number of queued fires.
    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn fire(id: TaskId, severity: Severity) -> FireEvent {
        FireEvent::new(id, "13:00:00", 1, "FIRE_DETECTED", severity)
    }

    #[test]
    fn higher_severity_jumps_the_queue() {
        let queue = TaskQueue::new(10);
        queue.push(fire(1, Severity::Low)).expect("queue closed");
        queue.push(fire(2, Severity::High)).expect("queue closed");
        queue.push(fire(3, Severity::Moderate)).expect("queue closed");

        assert_eq!(queue.dispatch_order(), vec![2, 3, 1]);
        let order: Vec<TaskId> = std::iter::from_fn(|| queue.try_pop())
            .map(|task| task.id)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_severity_keeps_arrival_order() {
        let queue = TaskQueue::new(10);
        for id in 1..=4 {
            queue.push(fire(id, Severity::Moderate)).expect("queue closed");
        }
        queue.push(fire(5, Severity::High)).expect("queue closed");
        queue.push(fire(6, Severity::Unknown)).expect("queue closed");
        assert_eq!(queue.dispatch_order(), vec![5, 1, 2, 3, 4, 6]);
    }

    #[test]
    fn requeued_fire_goes_behind_same_severity_peers() {
        let queue = TaskQueue::new(10);
        queue.push(fire(1, Severity::High)).expect("queue closed");
        queue.push(fire(2, Severity::High)).expect("queue closed");
        let first = queue.try_pop().expect("fire 1");
        queue.push(first).expect("queue closed");
        assert_eq!(queue.dispatch_order(), vec![2, 1]);
    }

    #[test]
    fn try_push_hands_fire_back_when_full() {
        let queue = TaskQueue::new(2);
        queue.try_push(fire(1, Severity::Low)).expect("room");
        queue.try_push(fire(2, Severity::High)).expect("room");
        let rejected = queue.try_push(fire(3, Severity::High)).unwrap_err();
        assert_eq!(rejected.id, 3);
        assert_eq!(queue.len(), 2);
        queue.try_pop();
        queue.try_push(rejected).expect("room after pop");
        assert_eq!(queue.dispatch_order(), vec![3, 1]);
        queue.close();
        assert!(queue.try_push(fire(4, Severity::Low)).is_err());
    }

    #[test]
    fn pop_blocking_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new(4));
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let queue_clone = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            ready_tx.send(()).expect("send ready");
            let task = queue_clone
                .pop_blocking_or_closed()
                .expect("task queue closed");
            tx.send(task.id).expect("send task id");
        });

        ready_rx.recv_timeout(Duration::from_secs(1)).expect("ready");
        queue.push(fire(99, Severity::Low)).expect("queue closed");

        let received = rx.recv_timeout(Duration::from_secs(1)).expect("task id");
        assert_eq!(received, 99);
        handle.join().expect("blocking pop thread panicked");
    }

    #[test]
    fn pop_blocking_or_closed_unblocks_on_close() {
        let queue = Arc::new(TaskQueue::new(4));
        let (done_tx, done_rx) = mpsc::channel();

        let queue_clone = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            done_tx
                .send(queue_clone.pop_blocking_or_closed().is_none())
                .expect("done");
        });

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).expect("done recv"));
        handle.join().expect("consumer thread panicked");
    }

    #[test]
    fn push_blocks_when_full_and_fails_after_close() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(fire(1, Severity::Low)).expect("queue closed");
        let (done_tx, done_rx) = mpsc::channel();

        let queue_clone = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            let result = queue_clone.push(fire(2, Severity::High));
            done_tx.send(result.map_err(|task| task.id)).expect("done");
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.close();
        let result = done_rx.recv_timeout(Duration::from_secs(1)).expect("done");
        assert_eq!(result, Err(2));
        handle.join().expect("producer panicked");
        assert_eq!(queue.len(), 1);
    }
}
