//! Bounded blocking job queue connecting the dispatch loop to the workers.
//!
//! `push` blocks while the queue is at capacity and `pop` blocks while it
//! is empty. `stop` wakes every waiter: a stopped queue rejects further
//! pushes, while `pop` keeps draining remaining jobs and returns `None`
//! once the queue is stopped and empty. Consumers treat that `None` as the
//! poison signal and exit.
//!
//! Within a single producer, dequeue order follows enqueue order; across
//! multiple consumers no cross-job ordering is guaranteed.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    jobs: VecDeque<T>,
    stopped: bool,
}

/// Blocking MPMC FIFO with a terminal "stopped" state.
pub struct JobQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    /// Signaled when a job is pushed or the queue is stopped.
    job_available: Condvar,
    /// Signaled when a job is popped or the queue is stopped.
    space_available: Condvar,
}

impl<T> JobQueue<T> {
    /// Queue with effectively unlimited capacity.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                stopped: false,
            }),
            job_available: Condvar::new(),
            space_available: Condvar::new(),
        }
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    /// Push a job, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was stopped before the job could be
    /// enqueued.
    pub fn push(&self, job: T) -> bool {
        let mut state = self.state.lock();
        while state.jobs.len() >= self.capacity && !state.stopped {
            self.space_available.wait(&mut state);
        }
        if state.stopped {
            return false;
        }
        state.jobs.push_back(job);
        self.job_available.notify_one();
        true
    }

    /// Pop a job, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is stopped and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while state.jobs.is_empty() && !state.stopped {
            self.job_available.wait(&mut state);
        }
        let job = state.jobs.pop_front();
        if job.is_some() {
            if state.jobs.is_empty() {
                self.space_available.notify_all();
            } else {
                self.space_available.notify_one();
            }
        }
        job
    }

    /// Block until the queue is drained or stopped.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.jobs.is_empty() && !state.stopped {
            self.space_available.wait(&mut state);
        }
    }

    /// Stop the queue and wake all waiters. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.job_available.notify_all();
        self.space_available.notify_all();
    }
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
