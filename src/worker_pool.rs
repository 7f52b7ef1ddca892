//! Fixed set of named worker threads fed from a bounded job queue.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::bounded_buffer::BoundedBuffer;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    lanes: Vec<Arc<BoundedBuffer<Job>>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads named `{name}-{index}` sharing one job queue.
    pub fn new(name: &str, workers: usize, queue_capacity: usize) -> io::Result<Self> {
        let lanes = vec![Arc::new(BoundedBuffer::new(queue_capacity))];
        Self::spawn(name, workers.max(1), lanes)
    }

    /// Spawn `workers` threads that each drain a queue of their own. Jobs
    /// queued under the same key run one at a time, in the order queued.
    pub fn keyed(name: &str, workers: usize, queue_capacity: usize) -> io::Result<Self> {
        let lanes = (0..workers.max(1))
            .map(|_| Arc::new(BoundedBuffer::new(queue_capacity)))
            .collect();
        Self::spawn(name, workers.max(1), lanes)
    }

    fn spawn(name: &str, workers: usize, lanes: Vec<Arc<BoundedBuffer<Job>>>) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let jobs = Arc::clone(&lanes[index % lanes.len()]);
            let thread_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Some(job) = jobs.pop() {
                        // A panicking handler must not take the worker down with it.
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!(worker = %thread_name, "job panicked");
                        }
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            name: name.to_string(),
            lanes,
            handles,
        })
    }

    fn lane(&self, key: u64) -> &BoundedBuffer<Job> {
        &self.lanes[(key % self.lanes.len() as u64) as usize]
    }

    /// Queue a job, waiting while the queue is full. Returns `false` if the
    /// pool is shutting down and the job was dropped.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_keyed(0, job)
    }

    /// Queue a job on the lane owning `key`.
    pub fn execute_keyed<F>(&self, key: u64, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.lane(key).push(Box::new(job)).is_err() {
            tracing::debug!(pool = %self.name, key, "pool closed; job dropped");
            return false;
        }
        true
    }

    /// Queue a job only if there is room; otherwise hand it back.
    pub fn try_execute(&self, job: Job) -> Result<(), Job> {
        self.lane(0).try_push(job)
    }

    pub fn queued(&self) -> usize {
        self.lanes.iter().map(|lane| lane.len()).sum()
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting jobs, let workers finish what is queued, and join them.
    pub fn shutdown(self) {
        for lane in &self.lanes {
            lane.close();
        }
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_job_before_shutdown_returns() {
        let pool = WorkerPool::new("test-pool", 3, 4).expect("spawn pool");
        assert_eq!(pool.size(), 3);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = Arc::clone(&done);
            assert!(pool.execute(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn jobs_run_on_named_workers_in_parallel() {
        let pool = WorkerPool::new("named", 2, 4).expect("spawn pool");
        let (tx, rx) = mpsc::channel();
        let gate = Arc::new(std::sync::Barrier::new(2));
        for _ in 0..2 {
            let tx = tx.clone();
            let gate = Arc::clone(&gate);
            pool.execute(move || {
                // Both jobs must be running at once to pass the barrier.
                gate.wait();
                let name = thread::current().name().unwrap_or("").to_string();
                tx.send(name).expect("send name");
            });
        }
        let mut names = HashSet::new();
        for _ in 0..2 {
            names.insert(rx.recv_timeout(Duration::from_secs(1)).expect("name"));
        }
        assert_eq!(
            names,
            HashSet::from(["named-0".to_string(), "named-1".to_string()])
        );
        pool.shutdown();
    }

    #[test]
    fn try_execute_hands_back_job_when_full() {
        let pool = WorkerPool::new("full", 1, 1).expect("spawn pool");
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            started_tx.send(()).expect("send");
            let _ = release_rx.recv();
        });
        started_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("worker busy");
        assert!(pool.try_execute(Box::new(|| {})).is_ok());
        assert_eq!(pool.queued(), 1);
        assert!(pool.try_execute(Box::new(|| {})).is_err());
        release_tx.send(()).expect("release");
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panicky", 1, 4).expect("spawn pool");
        pool.execute(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).expect("send"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).expect("survived"), 7);
        pool.shutdown();
    }

    #[test]
    fn same_key_runs_in_queue_order() {
        let pool = WorkerPool::keyed("lane", 3, 64).expect("spawn pool");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for value in 0..40 {
            let seen = Arc::clone(&seen);
            pool.execute_keyed(7, move || {
                if value == 0 {
                    thread::sleep(Duration::from_millis(20));
                }
                seen.lock().expect("seen mutex").push(value);
            });
        }
        pool.shutdown();
        let seen = seen.lock().expect("seen mutex").clone();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn different_keys_do_not_wait_on_each_other() {
        let pool = WorkerPool::keyed("lane", 2, 4).expect("spawn pool");
        let gate = Arc::new(std::sync::Barrier::new(2));
        let (tx, rx) = mpsc::channel();
        for key in 0..2u64 {
            let gate = Arc::clone(&gate);
            let tx = tx.clone();
            pool.execute_keyed(key, move || {
                gate.wait();
                tx.send(key).expect("send key");
            });
        }
        let mut keys = HashSet::new();
        for _ in 0..2 {
            keys.insert(rx.recv_timeout(Duration::from_secs(1)).expect("key"));
        }
        assert_eq!(keys, HashSet::from([0, 1]));
        pool.shutdown();
    }
}
