//! Removing one feature from a storable site.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use update_fs::NormalizedPath;
use update_model::{Feature, PluginEntry, Site, VersionedIdentifier};

use super::{ConsumerReport, TransactionState};
use crate::lock::LockGuard;
use crate::recovery::{LogEntryKind, LogTransaction};
use crate::{Error, Result, UpdateContext};

/// Delete-only transaction for one installed feature.
///
/// Plugins that another feature on the same site still lists are kept.
/// Nothing is touched until [`close`](Self::close).
pub struct RemoveTransaction<'ctx> {
    journal: LogTransaction<'ctx>,
    feature: Arc<Feature>,
    site: Arc<Site>,
    root: NormalizedPath,
    doomed: Vec<PluginEntry>,
    shared: Vec<VersionedIdentifier>,
    state: TransactionState,
    _locks: Vec<LockGuard<'ctx>>,
}

impl fmt::Debug for RemoveTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoveTransaction")
            .field("feature", self.feature.identifier())
            .field("site", self.site.url())
            .field("transaction", &self.journal.id())
            .field("state", &self.state)
            .finish()
    }
}

impl<'ctx> RemoveTransaction<'ctx> {
    pub fn begin(ctx: &'ctx UpdateContext, feature: Arc<Feature>, site: Arc<Site>) -> Result<Self> {
        let root = site.store_root().map_err(|_| Error::NotInstallable {
            site: site.url().to_string(),
        })?;
        let root = NormalizedPath::new(root);

        let in_use = plugins_used_elsewhere(&site, feature.identifier());
        let (shared, doomed): (Vec<PluginEntry>, Vec<PluginEntry>) = feature
            .plugins()
            .iter()
            .cloned()
            .partition(|entry| in_use.contains(entry.identifier()));

        let mut keys = BTreeSet::new();
        keys.insert(root.join(&feature.install_dir()).to_string());
        for entry in &doomed {
            keys.insert(root.join(&entry.install_path()).to_string());
        }
        let locks = keys.iter().map(|key| ctx.locks().acquire(key)).collect();

        tracing::info!(
            feature = %feature.identifier(),
            site = %site.url(),
            removing = doomed.len(),
            shared = shared.len(),
            "Remove transaction opened"
        );
        Ok(Self {
            journal: ctx.log().begin_transaction(),
            feature,
            site,
            root,
            doomed,
            shared: shared.into_iter().map(|e| e.identifier().clone()).collect(),
            state: TransactionState::Open,
            _locks: locks,
        })
    }

    pub fn feature(&self) -> &Arc<Feature> {
        &self.feature
    }

    /// Plugins kept because another feature on the site lists them.
    pub fn shared_plugins(&self) -> &[VersionedIdentifier] {
        &self.shared
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn delete(&self, path: &NormalizedPath, report: &mut ConsumerReport) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        self.journal.append(LogEntryKind::Delete, path)?;
        match update_fs::io::remove_path(&path.to_native()) {
            Ok(()) => report.removed.push(path.clone()),
            Err(e) => {
                report.warn(format!("could not delete {path}: {e}"));
                report.recovery_inconsistent = true;
            }
        }
        Ok(())
    }

    /// Delete the feature directory and its unshared plugins.
    ///
    /// A failed delete is a warning; a failed log write stops the removal.
    pub fn close(&mut self) -> Result<ConsumerReport> {
        if self.state.is_finished() {
            return Ok(ConsumerReport::repeated(self.state, "close"));
        }
        self.state = TransactionState::Closing;
        let mut report = ConsumerReport::default();

        for entry in &self.doomed {
            self.delete(&self.root.join(&entry.install_path()), &mut report)?;
            if self.site.remove_plugin_entry(entry.identifier()).is_some() {
                report.plugins.push(entry.identifier().clone());
            }
        }

        let feature_dir = self.root.join(&self.feature.install_dir());
        self.delete(&feature_dir, &mut report)?;
        if let Some(reference) = self.site.find_feature(self.feature.identifier()) {
            self.site.remove_feature_reference(reference.url());
        }

        self.journal.append(LogEntryKind::EndRemove, &feature_dir)?;
        self.state = TransactionState::Committed;
        tracing::info!(
            feature = %self.feature.identifier(),
            removed = report.removed.len(),
            inconsistent = report.recovery_inconsistent,
            "Feature removed"
        );
        Ok(report)
    }

    /// Give up before anything was deleted.
    pub fn abort(&mut self) -> ConsumerReport {
        if self.state.is_finished() {
            return ConsumerReport::repeated(self.state, "abort");
        }
        let mut report = ConsumerReport::default();
        if self.state == TransactionState::Closing {
            report.warn(format!(
                "removal of {} aborted part way; completed deletes are not restored",
                self.feature.identifier()
            ));
            report.recovery_inconsistent = true;
        }
        self.state = TransactionState::Aborted;
        report
    }
}

fn plugins_used_elsewhere(site: &Site, removing: &VersionedIdentifier) -> BTreeSet<VersionedIdentifier> {
    let mut used = BTreeSet::new();
    for reference in site.feature_references() {
        if reference.identifier().is_ok_and(|id| &id == removing) {
            continue;
        }
        match reference.feature() {
            Ok(feature) => used.extend(feature.plugins().iter().map(|p| p.identifier().clone())),
            Err(e) => tracing::warn!(reference = %reference, error = %e, "Could not resolve feature while checking shared plugins"),
        }
    }
    used
}
