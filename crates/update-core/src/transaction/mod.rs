//! Install and remove transactions.
//!
//! Content is staged into `<final>.tmp` files, each logged to the recovery
//! journal before it is written. Closing renames every staged file to its
//! final path (logging each rename first) without replacing existing files,
//! and registers what was installed only when every rename went through. A
//! failed rename fails the close and leaves the rest for abort, which
//! deletes whatever was staged or renamed (logging each delete first).
//!
//! ```text
//! Open --store--> Storing --close--> Closing --> Committed
//!   \                \                   \
//!    +----abort-------+-------abort-------+----> Aborted
//! ```
//!
//! Closing or aborting twice is reported, not repeated.

mod install;
mod overlay;
mod remove;
mod site_consumer;

use std::fmt;

use update_fs::NormalizedPath;
use update_model::{ContentReference, VersionedIdentifier};

use crate::Result;

pub use install::{InstallTransaction, PluginEntryConsumer};
pub use overlay::{OverlayStats, overlay_archive, unpack_archive};
pub use remove::RemoveTransaction;
pub use site_consumer::SiteContentConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Bound to a feature and a site; nothing written yet.
    Open,
    Storing,
    Closing,
    Committed,
    Aborted,
}

impl TransactionState {
    /// Committed or aborted.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    pub fn accepts_content(&self) -> bool {
        matches!(self, Self::Open | Self::Storing)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Storing => "storing",
            Self::Closing => "closing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        })
    }
}

/// Write side of content installation.
pub trait ContentConsumer {
    /// Stage one unit of content; returns the staged path.
    fn store(&mut self, reference: &ContentReference) -> Result<NormalizedPath>;

    /// Commit everything staged.
    fn close(&mut self) -> Result<ConsumerReport>;

    /// Discard everything staged. Best effort; problems are reported.
    fn abort(&mut self) -> ConsumerReport;

    fn state(&self) -> TransactionState;
}

/// What a close or abort did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Final paths created by a close.
    pub committed: Vec<NormalizedPath>,
    /// Paths deleted by an abort or a removal.
    pub removed: Vec<NormalizedPath>,
    /// Plugins registered or unregistered on the site.
    pub plugins: Vec<VersionedIdentifier>,
    pub warnings: Vec<String>,
    /// A delete failed after being logged; a recovery sweep is recommended.
    pub recovery_inconsistent: bool,
    /// The call was a repeated close or abort and did nothing.
    pub repeated: bool,
}

impl ConsumerReport {
    pub(crate) fn repeated(state: TransactionState, what: &str) -> Self {
        let message = format!("{what} called on a consumer that is already {state}");
        tracing::warn!(state = %state, "{message}");
        Self {
            warnings: vec![message],
            repeated: true,
            ..Self::default()
        }
    }

    pub(crate) fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    pub(crate) fn merge(&mut self, other: ConsumerReport) {
        self.committed.extend(other.committed);
        self.removed.extend(other.removed);
        self.plugins.extend(other.plugins);
        self.warnings.extend(other.warnings);
        self.recovery_inconsistent |= other.recovery_inconsistent;
    }
}
