//! Bounded trial worker pool.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  SearchController (sole admission point)   │
//! │    submit(job) ──► shared job queue (mpsc) │
//! │                         │                  │
//! │        ┌────────────────┼────────────┐     │
//! │        ▼                ▼            ▼     │
//! │   ┌─────────┐     ┌─────────┐  ┌─────────┐ │
//! │   │ trial-0 │     │ trial-1 │  │ trial-N │ │
//! │   └─────────┘     └─────────┘  └─────────┘ │
//! │        │  results / reports via channel    │
//! └────────┴───────────────────────────────────┘
//! ```
//!
//! The number of workers is the concurrency bound: a job only runs when a
//! worker is free, so the pool can never run more trials than it has threads.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Result, TunerError};

/// Configuration for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    /// Workers are named "{prefix}-{id}".
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            thread_name_prefix: "trial".to_string(),
        }
    }
}

/// Fixed set of threads pulling jobs from one queue.
pub struct WorkerPool<T> {
    config: WorkerPoolConfig,
    queue: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T> WorkerPool<T>
where
    T: Send + 'static,
{
    pub fn new<F>(config: WorkerPoolConfig, worker_fn: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if config.num_workers == 0 {
            return Err(TunerError::config("worker pool needs at least one worker"));
        }

        let (tx, rx) = mpsc::channel::<T>();
        let rx = Arc::new(Mutex::new(rx));
        let worker_fn = Arc::new(worker_fn);

        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let rx = Arc::clone(&rx);
            let worker_fn = Arc::clone(&worker_fn);
            let name = format!("{}-{}", config.thread_name_prefix, worker_id);

            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || Self::worker_loop(rx, worker_fn))
                .map_err(|e| TunerError::io(name, e))?;
            workers.push(handle);
        }

        Ok(Self {
            config,
            queue: Some(tx),
            workers,
        })
    }

    fn worker_loop(rx: Arc<Mutex<Receiver<T>>>, worker_fn: Arc<dyn Fn(T) + Send + Sync>) {
        loop {
            // Hold the lock only while taking a job.
            let job = match rx.lock() {
                Ok(guard) => guard.recv(),
                Err(_) => return,
            };
            match job {
                Ok(job) => worker_fn(job),
                Err(_) => return, // queue closed
            }
        }
    }

    /// Queue a job. It runs as soon as a worker is free.
    pub fn submit(&self, job: T) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| TunerError::config("worker pool is shut down"))?;
        queue
            .send(job)
            .map_err(|_| TunerError::config("all pool workers have exited"))
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Close the queue and wait for every queued job to finish.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.queue.take();
        while let Some(handle) = self.workers.pop() {
            if handle.join().is_err() {
                log::error!("A trial worker panicked");
            }
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.queue.take();
        while let Some(handle) = self.workers.pop() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn every_job_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let pool = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 3,
                thread_name_prefix: "test-pool".into(),
            },
            move |n: usize| {
                counter_clone.fetch_add(n, Ordering::SeqCst);
            },
        )
        .unwrap();

        for n in 1..=10 {
            pool.submit(n).unwrap();
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 55);
    }

    #[test]
    fn concurrency_never_exceeds_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        let pool = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 2,
                thread_name_prefix: "bound".into(),
            },
            move |_: ()| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                r.fetch_sub(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        for _ in 0..12 {
            pool.submit(()).unwrap();
        }
        pool.join();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 0,
                thread_name_prefix: "none".into(),
            },
            |_: ()| {},
        );
        assert!(result.is_err());
    }

    #[test]
    fn drop_does_not_hang() {
        let pool = WorkerPool::new(WorkerPoolConfig::default(), |_: ()| {
            thread::sleep(Duration::from_millis(2));
        })
        .unwrap();
        pool.submit(()).unwrap();
        drop(pool);
    }
}
