//! Bounded job queue: dispatcher thread → worker threads.
//!
//! Design:
//! - Fixed-capacity lock-free ring (`ArrayQueue`) holds the jobs
//! - Mutex + Condvar only for parking idle workers
//! - Enqueue never blocks; it fails when the ring is saturated
//! - Strict FIFO, no priorities
//!
//! ```text
//!   dispatcher ──enqueue──► [ job | job | job | ... ] ──dequeue──► worker N
//!                                    │
//!                           notify_one (Condvar)
//! ```
//!
//! The queue carries readiness events only; it never sees database state.

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a dequeue attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    /// A job to run.
    Job(T),
    /// Nothing available (non-blocking / timed variants only).
    Empty,
    /// The queue was shut down; the worker should exit.
    Shutdown,
}

/// Bounded MPMC FIFO with blocking dequeue.
pub struct JobQueue<T> {
    items: ArrayQueue<T>,
    lock: Mutex<()>,
    cond: Condvar,
    shutdown: AtomicBool,
    parked: AtomicUsize,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
        }
    }

    /// Append `item` and wake one parked worker.
    ///
    /// Returns the item back if the queue is full or shut down.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(item);
        }
        self.items.push(item)?;
        // Taking the lock orders this notify after any worker that has
        // already checked for emptiness and is about to wait.
        let _guard = self.lock.lock();
        self.cond.notify_one();
        Ok(())
    }

    /// Block until a job is available or the queue is shut down.
    pub fn dequeue(&self) -> Dequeued<T> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Dequeued::Shutdown;
            }
            if let Some(item) = self.items.pop() {
                return Dequeued::Job(item);
            }
            let mut guard = self.lock.lock();
            if self.items.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                self.parked.fetch_add(1, Ordering::AcqRel);
                self.cond.wait(&mut guard);
                self.parked.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Like `dequeue` but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Dequeued<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Dequeued::Shutdown;
            }
            if let Some(item) = self.items.pop() {
                return Dequeued::Job(item);
            }
            let mut guard = self.lock.lock();
            if self.items.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                self.parked.fetch_add(1, Ordering::AcqRel);
                let timed_out = self.cond.wait_until(&mut guard, deadline).timed_out();
                self.parked.fetch_sub(1, Ordering::AcqRel);
                if timed_out {
                    drop(guard);
                    return match self.items.pop() {
                        Some(item) => Dequeued::Job(item),
                        None => Dequeued::Empty,
                    };
                }
            }
        }
    }

    /// Never blocks.
    pub fn try_dequeue(&self) -> Dequeued<T> {
        if self.shutdown.load(Ordering::Acquire) {
            return Dequeued::Shutdown;
        }
        match self.items.pop() {
            Some(item) => Dequeued::Job(item),
            None => Dequeued::Empty,
        }
    }

    /// Discard pending jobs and release every waiting worker with
    /// [`Dequeued::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        while self.items.pop().is_some() {}
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Number of workers currently parked in `dequeue`.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }
}
