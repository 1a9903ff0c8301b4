//! Per-unit results of batch operations.

use std::fmt;
use std::sync::Arc;

use update_model::{FilterReport, VersionedIdentifier};

use crate::download::{CancellationToken, DownloadMonitor};
use crate::transaction::ConsumerReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Installed,
    /// Already present on the target site; only configured.
    AlreadyInstalled,
    Removed,
    /// Optional included feature the caller did not select.
    NotSelected,
    /// Not attempted.
    Skipped { reason: String },
    Failed { message: String },
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Installed => f.write_str("installed"),
            Self::AlreadyInstalled => f.write_str("already installed"),
            Self::Removed => f.write_str("removed"),
            Self::NotSelected => f.write_str("not selected"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Failed { message } => write!(f, "failed ({message})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub feature: VersionedIdentifier,
    pub status: UnitStatus,
    /// What the unit's transaction did, when one ran.
    pub report: Option<ConsumerReport>,
}

/// Outcome of installing or removing a feature tree.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<UnitOutcome>,
    /// Entries left out because they do not apply to this platform.
    pub filtered: FilterReport,
    pub warnings: Vec<String>,
    /// Some delete failed after being logged; the recovery log
    /// was kept for a later sweep.
    pub recovery_inconsistent: bool,
}

impl BatchReport {
    pub(crate) fn record(&mut self, feature: VersionedIdentifier, status: UnitStatus, report: Option<ConsumerReport>) {
        match &status {
            UnitStatus::Failed { message } => {
                tracing::warn!(feature = %feature, error = %message, "Unit failed");
            }
            other => tracing::debug!(feature = %feature, status = %other, "Unit finished"),
        }
        if let Some(report) = &report {
            self.recovery_inconsistent |= report.recovery_inconsistent;
            self.warnings.extend(report.warnings.iter().cloned());
        }
        self.outcomes.push(UnitOutcome { feature, status, report });
    }

    pub(crate) fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    pub fn outcome(&self, feature: &VersionedIdentifier) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| &o.feature == feature)
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, UnitStatus::Failed { .. }))
    }

    /// Units that reached their goal state.
    pub fn succeeded(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| {
            matches!(
                o.status,
                UnitStatus::Installed | UnitStatus::AlreadyInstalled | UnitStatus::Removed
            )
        })
    }

    /// Every attempted unit succeeded; unselected optional units do not count.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| {
            !matches!(o.status, UnitStatus::Failed { .. } | UnitStatus::Skipped { .. })
        })
    }

    /// Some units succeeded and some did not.
    pub fn is_partial(&self) -> bool {
        !self.is_success() && self.succeeded().next().is_some()
    }
}

/// Knobs for [`UpdateEngine::install_feature`](super::UpdateEngine::install_feature).
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Optional included features the user selected.
    pub optional: Vec<VersionedIdentifier>,
    /// Also install patches for the root feature published on the same site.
    pub include_patches: bool,
    pub cancel: Option<CancellationToken>,
    pub monitor: Option<Arc<DownloadMonitor>>,
}

impl InstallOptions {
    pub fn with_optional(mut self, feature: VersionedIdentifier) -> Self {
        self.optional.push(feature);
        self
    }

    pub fn with_patches(mut self) -> Self {
        self.include_patches = true;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<DownloadMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}
