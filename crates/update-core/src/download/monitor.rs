//! Aggregated progress across concurrent downloads.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Point-in-time view of aggregate progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub expected: u64,
    pub copied: u64,
    /// Always within `0..=100`.
    pub percent: u8,
}

impl ProgressSnapshot {
    fn compute(expected: u64, copied: u64) -> Self {
        let percent = if expected == 0 {
            0
        } else {
            (copied.saturating_mul(100) / expected).min(100) as u8
        };
        Self {
            expected,
            copied,
            percent,
        }
    }
}

type Listener = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

#[derive(Default)]
struct Totals {
    expected: u64,
    copied: u64,
    per_archive: HashMap<String, u64>,
}

/// Thread-safe byte counter shared by the workers of one download batch.
///
/// Counters only grow. The percentage is recomputed from the latest totals
/// on every update, so an upward revision of the expected size never yields
/// a value above 100.
#[derive(Default)]
pub struct DownloadMonitor {
    totals: Mutex<Totals>,
    listener: Option<Listener>,
}

impl fmt::Debug for DownloadMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadMonitor")
            .field("progress", &self.snapshot())
            .finish()
    }
}

impl DownloadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every update to `listener`.
    pub fn with_listener(listener: impl Fn(ProgressSnapshot) + Send + Sync + 'static) -> Self {
        Self {
            totals: Mutex::default(),
            listener: Some(Box::new(listener)),
        }
    }

    fn totals(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce (or revise upward) the expected size of an archive.
    pub fn expect(&self, archive_id: &str, bytes: u64) -> ProgressSnapshot {
        let snapshot = {
            let mut totals = self.totals();
            let previous = totals.per_archive.get(archive_id).copied().unwrap_or(0);
            if bytes > previous {
                totals.per_archive.insert(archive_id.to_string(), bytes);
                totals.expected += bytes - previous;
            }
            ProgressSnapshot::compute(totals.expected, totals.copied)
        };
        self.notify(snapshot);
        snapshot
    }

    /// Record `bytes` more copied.
    pub fn copied(&self, bytes: u64) -> ProgressSnapshot {
        let snapshot = {
            let mut totals = self.totals();
            totals.copied = totals.copied.saturating_add(bytes);
            ProgressSnapshot::compute(totals.expected, totals.copied)
        };
        self.notify(snapshot);
        snapshot
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let totals = self.totals();
        ProgressSnapshot::compute(totals.expected, totals.copied)
    }

    fn notify(&self, snapshot: ProgressSnapshot) {
        if let Some(listener) = &self.listener {
            listener(snapshot);
        }
    }
}
