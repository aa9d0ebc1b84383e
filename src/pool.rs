//! Elastic worker pool.
//!
//! [`ElasticPool::new`] with a width of zero gives a pool that runs every job
//! inline on the calling thread, in input order. Any other width gives a real
//! pool of that many threads whose results arrive in completion order. Call
//! sites are identical either way, so parallelism can be switched off for
//! debugging without touching them.

use crate::error::{GhccError, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool that is either parallel or inline, chosen by width.
pub enum ElasticPool {
    Parallel(ThreadPool),
    Inline,
}

impl ElasticPool {
    /// Create a pool with `width` worker threads, or an inline pool for zero.
    pub fn new(width: usize) -> Result<Self> {
        if width == 0 {
            Ok(Self::Inline)
        } else {
            Ok(Self::Parallel(ThreadPool::new(width)?))
        }
    }

    /// Number of worker threads (zero when inline).
    pub fn width(&self) -> usize {
        match self {
            Self::Parallel(pool) => pool.width(),
            Self::Inline => 0,
        }
    }

    /// Apply `f` to every item, yielding results as they complete.
    ///
    /// The inline variant evaluates lazily, one item per `next()`, in input order.
    pub fn map_unordered<T, R, F, I>(&self, f: F, items: I) -> Result<MapUnordered<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        match self {
            Self::Parallel(pool) => pool.map_unordered(f, items),
            Self::Inline => {
                let items: Vec<T> = items.into_iter().collect();
                Ok(MapUnordered::Inline(Box::new(items.into_iter().map(f))))
            }
        }
    }

    /// Stop accepting work. No-op for the inline pool.
    pub fn close(&mut self) {
        if let Self::Parallel(pool) = self {
            pool.close();
        }
    }

    /// Wait for worker threads to exit after [`close`](Self::close). No-op for the inline pool.
    pub fn join(&mut self) {
        if let Self::Parallel(pool) = self {
            pool.join();
        }
    }
}

/// Lazy sequence of results from [`ElasticPool::map_unordered`].
pub enum MapUnordered<R> {
    Channel { receiver: Receiver<R>, remaining: usize },
    Inline(Box<dyn Iterator<Item = R>>),
}

impl<R> Iterator for MapUnordered<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        match self {
            Self::Channel {
                receiver,
                remaining,
            } => {
                if *remaining == 0 {
                    return None;
                }
                // A job that panicked never sends; once every sender is gone recv fails.
                match receiver.recv() {
                    Ok(value) => {
                        *remaining -= 1;
                        Some(value)
                    }
                    Err(_) => {
                        *remaining = 0;
                        None
                    }
                }
            }
            Self::Inline(iter) => iter.next(),
        }
    }
}

/// Fixed-size pool of threads pulling jobs from a shared MPMC queue.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    fn new(width: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(width);
        for id in 0..width {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("ghcc-pool-{}", id))
                .spawn(move || worker_loop(id, receiver))?;
            workers.push(handle);
        }
        debug!(width, "Started thread pool");

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    fn width(&self) -> usize {
        self.workers.len()
    }

    fn map_unordered<T, R, F, I>(&self, f: F, items: I) -> Result<MapUnordered<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        let sender = self.sender.as_ref().ok_or(GhccError::PoolClosed)?;
        let f = Arc::new(f);
        let (result_tx, result_rx) = unbounded();

        let mut submitted = 0;
        for item in items {
            let f = Arc::clone(&f);
            let result_tx = result_tx.clone();
            sender
                .send(Box::new(move || {
                    let _ = result_tx.send(f(item));
                }))
                .map_err(|_| GhccError::PoolClosed)?;
            submitted += 1;
        }

        Ok(MapUnordered::Channel {
            receiver: result_rx,
            remaining: submitted,
        })
    }

    fn close(&mut self) {
        self.sender.take();
    }

    fn join(&mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(id: usize, receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker_id = id, "Pool job panicked");
        }
    }
}
