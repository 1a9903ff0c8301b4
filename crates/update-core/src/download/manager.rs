//! Bounded parallel downloads grouped into joinable, cancellable batches.
//!
//! Each worker runs on its own OS thread and takes one of the manager's
//! slots before starting. Slot acquisition polls at a fixed interval rather
//! than waiting on a condition variable; the bound is a soft limit and
//! polling keeps cancellation checks simple.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};

use crate::{Error, Result};

/// Cooperative cancellation flag shared by a group's workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Process-wide limiter for concurrent downloads.
#[derive(Debug)]
pub struct MultiDownloadManager {
    max_concurrent: usize,
    poll_interval: Duration,
    in_use: Mutex<usize>,
}

impl MultiDownloadManager {
    pub fn new(max_concurrent: usize, poll_interval: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            poll_interval,
            in_use: Mutex::new(0),
        }
    }

    fn counter(&self) -> MutexGuard<'_, usize> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_use(&self) -> usize {
        *self.counter()
    }

    /// Wait for a free slot, polling every `poll_interval`.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires while waiting.
    pub fn acquire_slot(&self, cancel: &CancellationToken) -> Result<SlotGuard<'_>> {
        let mut policy = Constant::new(self.poll_interval);
        loop {
            cancel.check()?;
            {
                let mut in_use = self.counter();
                if *in_use < self.max_concurrent {
                    *in_use += 1;
                    return Ok(SlotGuard { manager: self });
                }
            }
            thread::sleep(policy.next_backoff().unwrap_or(self.poll_interval));
        }
    }

    fn release_slot(&self) {
        let mut in_use = self.counter();
        *in_use = in_use.saturating_sub(1);
    }

    /// Start a new worker group.
    pub fn group<T: Send + 'static>(self: &Arc<Self>, name: impl Into<String>) -> TransactionGroup<T> {
        self.group_with_cancellation(name, CancellationToken::new())
    }

    /// Start a worker group whose workers observe `cancel`.
    pub fn group_with_cancellation<T: Send + 'static>(
        self: &Arc<Self>,
        name: impl Into<String>,
        cancel: CancellationToken,
    ) -> TransactionGroup<T> {
        TransactionGroup {
            name: name.into(),
            manager: Arc::clone(self),
            cancel,
            workers: Vec::new(),
        }
    }
}

/// A held download slot; released on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    manager: &'a MultiDownloadManager,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_slot();
    }
}

struct Worker<T> {
    label: String,
    handle: JoinHandle<Result<T>>,
}

/// Threads started together that are joined or cancelled together.
pub struct TransactionGroup<T> {
    name: String,
    manager: Arc<MultiDownloadManager>,
    cancel: CancellationToken,
    workers: Vec<Worker<T>>,
}

impl<T> fmt::Debug for TransactionGroup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionGroup")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> TransactionGroup<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `task` on a new thread once a slot is free.
    ///
    /// The task receives the group's cancellation token and must check it
    /// at chunk boundaries.
    pub fn spawn<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    {
        let label = label.into();
        let manager = Arc::clone(&self.manager);
        let cancel = self.cancel.clone();
        let thread_label = label.clone();
        let handle = thread::spawn(move || {
            let _slot = manager.acquire_slot(&cancel)?;
            tracing::debug!(worker = %thread_label, "Download worker started");
            task(&cancel)
        });
        self.workers.push(Worker { label, handle });
    }

    /// Ask every worker to stop at its next chunk boundary.
    pub fn cancel_all(&self) {
        tracing::info!(group = %self.name, workers = self.workers.len(), "Cancelling download group");
        self.cancel.cancel();
    }

    /// Join every worker, in spawn order.
    pub fn wait_for_all(self) -> Vec<(String, Result<T>)> {
        self.workers
            .into_iter()
            .map(|worker| {
                let result = worker.handle.join().unwrap_or_else(|_| {
                    Err(Error::download(
                        worker.label.clone(),
                        std::io::Error::other("download worker panicked"),
                    ))
                });
                (worker.label, result)
            })
            .collect()
    }
}
