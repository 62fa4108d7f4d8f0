// Fixed-size frame worker pool
//
// Threads live for the lifetime of the pool. Stopping the pipeline drains it
// instead of tearing it down, and starting again only reopens the intake.

use anyhow::Result;
use crossbeam::channel::{self, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool is not accepting work")]
    Idle,
    #[error("worker queue is full")]
    Full,
}

struct PoolShared {
    accepting: AtomicBool,
    /// Jobs queued or running
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl PoolShared {
    fn finish_one(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads behind a queue of `queue_depth` jobs.
    /// The pool starts idle; call `resume` to accept work.
    pub fn new(workers: usize, queue_depth: usize) -> Result<Self> {
        let (tx, rx) = channel::bounded::<Job>(queue_depth.max(1));
        let shared = Arc::new(PoolShared {
            accepting: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("frame-worker-{}", i))
                .spawn(move || {
                    for job in rx {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("Frame job panicked");
                        }
                        shared.finish_one();
                    }
                })?;
            handles.push(handle);
        }
        tracing::info!(workers = handles.len(), queue_depth, "Worker pool started");

        Ok(Self {
            tx: Some(tx),
            shared,
            handles,
        })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a job without blocking. A rejected job is dropped unrun.
    pub fn submit<F>(&self, job: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(SubmitError::Idle);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(SubmitError::Idle);
        };

        *self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        match tx.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.finish_one();
                match e {
                    TrySendError::Full(_) => Err(SubmitError::Full),
                    TrySendError::Disconnected(_) => Err(SubmitError::Idle),
                }
            }
        }
    }

    /// Stop accepting and block until every queued and running job is done
    pub fn drain(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let mut in_flight = self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while *in_flight > 0 {
            in_flight = self
                .shared
                .idle
                .wait(in_flight)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn resume(&self) {
        self.shared.accepting.store(true, Ordering::SeqCst);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        // Closing the channel ends each worker's receive loop
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Worker thread exited abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_new_pool_is_idle() {
        let pool = WorkerPool::new(2, 4).unwrap();
        assert_eq!(pool.submit(|| {}), Err(SubmitError::Idle));
        pool.resume();
        assert!(pool.submit(|| {}).is_ok());
        pool.drain();
    }

    #[test]
    fn test_drain_waits_for_running_jobs() {
        let pool = WorkerPool::new(2, 8).unwrap();
        pool.resume();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let done = done.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.drain();
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(pool.in_flight(), 0);
        assert!(!pool.is_accepting());
    }

    #[test]
    fn test_full_queue_rejects() {
        let pool = WorkerPool::new(1, 1).unwrap();
        pool.resume();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);

        pool.submit(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().ok();
        })
        .unwrap();
        started_rx.recv().unwrap();

        // The single worker is busy: one job fits in the queue, the next does not
        assert!(pool.submit(|| {}).is_ok());
        assert_eq!(pool.submit(|| {}), Err(SubmitError::Full));

        drop(gate_tx);
        pool.drain();
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_threads_survive_drain_and_resume() {
        let pool = WorkerPool::new(3, 4).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            pool.resume();
            let count = count.clone();
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            pool.drain();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(pool.workers(), 3);
    }

    #[test]
    fn test_panicking_job_does_not_block_drain() {
        let pool = WorkerPool::new(1, 2).unwrap();
        pool.resume();
        pool.submit(|| panic!("bad frame")).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.submit(move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        pool.drain();
        assert!(ran.load(Ordering::SeqCst));
    }
}
