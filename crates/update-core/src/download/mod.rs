//! Concurrent download coordination.

mod fetch;
mod manager;
mod monitor;

pub use fetch::{ContentFetcher, DefaultFetcher, transfer};
pub use manager::{CancellationToken, MultiDownloadManager, SlotGuard, TransactionGroup};
pub use monitor::{DownloadMonitor, ProgressSnapshot};
