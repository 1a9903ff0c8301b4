//! Installing one feature into a storable site.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use update_fs::NormalizedPath;
use update_model::manifest::{FEATURE_MANIFEST, render_feature_manifest};
use update_model::{ContentReference, Feature, FeatureReference, PluginEntry, Site, VersionedIdentifier};

use super::overlay::{overlay_archive, unpack_archive};
use super::site_consumer::SiteContentConsumer;
use super::{ConsumerReport, ContentConsumer, TransactionState};
use crate::download::{CancellationToken, DownloadMonitor};
use crate::lock::LockGuard;
use crate::recovery::LogEntryKind;
use crate::{Error, Result, UpdateContext};

/// Install of one feature and its plugins into one site.
///
/// Holds the named locks for the feature directory and every plugin
/// install path from `begin` until the transaction is dropped. Files are
/// staged through a [`SiteContentConsumer`]; the site's registries are only
/// updated once every rename succeeded.
pub struct InstallTransaction<'ctx> {
    feature: Arc<Feature>,
    site: Arc<Site>,
    consumer: SiteContentConsumer<'ctx>,
    pending: Vec<PluginEntry>,
    committed: Vec<NormalizedPath>,
    registered_plugins: Vec<VersionedIdentifier>,
    registered_feature: Option<url::Url>,
    state: TransactionState,
    _locks: Vec<LockGuard<'ctx>>,
}

impl fmt::Debug for InstallTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallTransaction")
            .field("feature", self.feature.identifier())
            .field("site", self.site.url())
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<'ctx> InstallTransaction<'ctx> {
    /// Bind `feature` to `site` and take the install-path locks.
    ///
    /// Blocks while another transaction holds any of the same paths.
    pub fn begin(ctx: &'ctx UpdateContext, feature: Arc<Feature>, site: Arc<Site>) -> Result<Self> {
        if !site.is_storable() {
            return Err(Error::NotInstallable {
                site: site.url().to_string(),
            });
        }
        let consumer = SiteContentConsumer::new(ctx, &site)?;

        let mut keys = BTreeSet::new();
        keys.insert(consumer.root().join(&feature.install_dir()).to_string());
        for entry in feature.plugins() {
            keys.insert(consumer.root().join(&entry.install_path()).to_string());
        }
        // Sorted acquisition keeps two installs sharing plugins from deadlocking.
        let locks = keys.iter().map(|key| ctx.locks().acquire(key)).collect();

        tracing::info!(feature = %feature.identifier(), site = %site.url(), "Install transaction opened");
        Ok(Self {
            feature,
            site,
            consumer,
            pending: Vec::new(),
            committed: Vec::new(),
            registered_plugins: Vec::new(),
            registered_feature: None,
            state: TransactionState::Open,
            _locks: locks,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.consumer.set_cancellation(cancel);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<DownloadMonitor>) -> Self {
        self.consumer.set_monitor(monitor);
        self
    }

    pub fn feature(&self) -> &Arc<Feature> {
        &self.feature
    }

    pub fn site(&self) -> &Arc<Site> {
        &self.site
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.consumer.cancellation()
    }

    /// Sub-consumer for one plugin entry of the feature.
    pub fn plugin_consumer(&mut self, entry: &PluginEntry) -> Result<PluginEntryConsumer<'_, 'ctx>> {
        if !self.state.accepts_content() {
            return Err(Error::ConsumerClosed {
                state: self.state.to_string(),
            });
        }
        if !self.feature.plugins().iter().any(|p| p.identifier() == entry.identifier()) {
            return Err(Error::UnknownPlugin {
                plugin: entry.identifier().to_string(),
                feature: self.feature.identifier().to_string(),
            });
        }
        Ok(PluginEntryConsumer {
            tx: self,
            entry: entry.clone(),
            final_path: None,
            state: TransactionState::Open,
        })
    }

    /// Stage and hand over one plugin in a single call.
    pub fn store_plugin(&mut self, entry: &PluginEntry, reference: &ContentReference) -> Result<NormalizedPath> {
        let mut consumer = self.plugin_consumer(entry)?;
        let staged = consumer.store(reference)?;
        consumer.close()?;
        Ok(staged)
    }

    fn register(&mut self, report: &mut ConsumerReport) -> Result<()> {
        let root = self.consumer.root().clone();
        for entry in std::mem::take(&mut self.pending) {
            self.consumer
                .journal()
                .append(LogEntryKind::Plugin, &root.join(&entry.install_path()))?;
            let identifier = entry.identifier().clone();
            if self.site.add_plugin_entry(entry) {
                self.registered_plugins.push(identifier.clone());
            }
            report.plugins.push(identifier);
        }

        let feature_dir = root.join(&self.feature.install_dir());
        self.consumer.journal().append(LogEntryKind::Feature, &feature_dir)?;
        let manifest_url = self.site.feature_manifest_url(self.feature.identifier())?;
        let reference = FeatureReference::resolved(
            self.site.url().clone(),
            manifest_url.clone(),
            Feature::clone(&self.feature),
        );
        if self.site.add_feature_reference(reference) {
            self.registered_feature = Some(manifest_url);
        }

        self.consumer.journal().append(LogEntryKind::EndInstall, &feature_dir)?;
        Ok(())
    }
}

impl ContentConsumer for InstallTransaction<'_> {
    /// Stage a non-plugin file of the feature.
    fn store(&mut self, reference: &ContentReference) -> Result<NormalizedPath> {
        if !self.state.accepts_content() {
            return Err(Error::ConsumerClosed {
                state: self.state.to_string(),
            });
        }
        let staged = self.consumer.store(reference)?;
        self.state = TransactionState::Storing;
        Ok(staged)
    }

    fn close(&mut self) -> Result<ConsumerReport> {
        if self.state.is_finished() {
            return Ok(ConsumerReport::repeated(self.state, "close"));
        }
        self.state = TransactionState::Closing;

        let manifest = render_feature_manifest(&self.feature)?;
        let relative = format!("{}/{}", self.feature.install_dir(), FEATURE_MANIFEST);
        self.consumer.stage_bytes(&relative, manifest.as_bytes())?;

        let mut report = self.consumer.close()?;
        self.committed = report.committed.clone();
        self.register(&mut report)?;

        self.state = TransactionState::Committed;
        tracing::info!(
            feature = %self.feature.identifier(),
            plugins = report.plugins.len(),
            inconsistent = report.recovery_inconsistent,
            "Feature installed"
        );
        Ok(report)
    }

    fn abort(&mut self) -> ConsumerReport {
        if self.state.is_finished() {
            return ConsumerReport::repeated(self.state, "abort");
        }

        let mut report = if self.consumer.state().is_finished() {
            ConsumerReport::default()
        } else {
            self.consumer.abort()
        };
        // A close that failed after its renames leaves final files behind.
        for path in std::mem::take(&mut self.committed).iter().rev() {
            self.consumer.delete_logged(path, &mut report);
        }
        for identifier in std::mem::take(&mut self.registered_plugins) {
            self.site.remove_plugin_entry(&identifier);
            report.plugins.push(identifier);
        }
        if let Some(url) = self.registered_feature.take() {
            self.site.remove_feature_reference(&url);
        }
        self.pending.clear();

        self.state = TransactionState::Aborted;
        tracing::info!(feature = %self.feature.identifier(), removed = report.removed.len(), "Install transaction aborted");
        report
    }

    fn state(&self) -> TransactionState {
        self.state
    }
}

impl Drop for InstallTransaction<'_> {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            tracing::warn!(feature = %self.feature.identifier(), state = %self.state, "Install transaction dropped before close, aborting");
            self.abort();
        }
    }
}

/// Stages the archive of one plugin entry.
///
/// Packed plugins are copied as-is, or overlaid onto the installed archive
/// of their delta base when one is declared and present. Plugins marked
/// for unpacking are extracted into a directory and never overlaid.
/// Closing hands the entry to the enclosing transaction for registration.
pub struct PluginEntryConsumer<'t, 'ctx> {
    tx: &'t mut InstallTransaction<'ctx>,
    entry: PluginEntry,
    final_path: Option<NormalizedPath>,
    state: TransactionState,
}

impl fmt::Debug for PluginEntryConsumer<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEntryConsumer")
            .field("plugin", self.entry.identifier())
            .field("state", &self.state)
            .finish()
    }
}

impl PluginEntryConsumer<'_, '_> {
    pub fn entry(&self) -> &PluginEntry {
        &self.entry
    }

    fn installed_base(&self) -> Option<NormalizedPath> {
        let base = self.entry.delta_base()?;
        let identifier = VersionedIdentifier::new(self.entry.id(), base.clone());
        let path = self
            .tx
            .consumer
            .root()
            .join(&PluginEntry::new(identifier).archive_id());
        if path.is_file() {
            Some(path)
        } else {
            tracing::debug!(plugin = %self.entry.identifier(), base = %base, "Delta base not installed, storing full archive");
            None
        }
    }

    fn store_unpacked(&mut self, reference: &ContentReference, relative: &str) -> Result<NormalizedPath> {
        let consumer = &mut self.tx.consumer;
        let download = consumer.scratch_path(&self.entry.archive_id(), "download")?;
        consumer.transfer_to(reference, &download.to_native())?;
        let staged = consumer.stage_with(relative, |_, temp| {
            unpack_archive(&download.to_native(), temp)
                .map(|_| ())
                .map_err(|e| Error::io(temp, e))
        })?;
        consumer.discard_scratch(&download)?;
        Ok(staged)
    }

    fn store_overlay(
        &mut self,
        reference: &ContentReference,
        relative: &str,
        base: NormalizedPath,
    ) -> Result<NormalizedPath> {
        let consumer = &mut self.tx.consumer;
        let delta = consumer.scratch_path(relative, "delta")?;
        consumer.transfer_to(reference, &delta.to_native())?;
        let staged = consumer.stage_with(relative, |_, temp| {
            overlay_archive(&base.to_native(), &delta.to_native(), temp)
                .map(|_| ())
                .map_err(|e| Error::io(temp, e))
        })?;
        consumer.discard_scratch(&delta)?;
        Ok(staged)
    }
}

impl ContentConsumer for PluginEntryConsumer<'_, '_> {
    fn store(&mut self, reference: &ContentReference) -> Result<NormalizedPath> {
        if !self.state.accepts_content() || self.final_path.is_some() {
            return Err(Error::ConsumerClosed {
                state: self.state.to_string(),
            });
        }
        let relative = self.entry.install_path();
        self.final_path = Some(self.tx.consumer.final_path(&relative)?);
        self.state = TransactionState::Storing;
        self.tx.state = TransactionState::Storing;

        if self.entry.is_unpack() {
            self.store_unpacked(reference, &relative)
        } else if let Some(base) = self.installed_base() {
            self.store_overlay(reference, &relative, base)
        } else {
            self.tx
                .consumer
                .stage_with(&relative, |consumer, temp| consumer.transfer_to(reference, temp).map(|_| ()))
        }
    }

    fn close(&mut self) -> Result<ConsumerReport> {
        if self.state.is_finished() {
            return Ok(ConsumerReport::repeated(self.state, "close"));
        }
        let mut report = ConsumerReport::default();
        if self.final_path.is_some() {
            self.tx.pending.push(self.entry.clone());
            report.plugins.push(self.entry.identifier().clone());
        } else {
            report.warn(format!("plugin {} closed without content", self.entry.identifier()));
        }
        self.state = TransactionState::Committed;
        Ok(report)
    }

    fn abort(&mut self) -> ConsumerReport {
        if self.state.is_finished() {
            return ConsumerReport::repeated(self.state, "abort");
        }
        let mut report = ConsumerReport::default();
        if let Some(final_path) = self.final_path.take() {
            self.tx.consumer.unstage(&final_path, &mut report);
        }
        self.state = TransactionState::Aborted;
        tracing::debug!(plugin = %self.entry.identifier(), "Plugin entry aborted");
        report
    }

    fn state(&self) -> TransactionState {
        self.state
    }
}

impl Drop for PluginEntryConsumer<'_, '_> {
    fn drop(&mut self) {
        if !self.state.is_finished() && self.final_path.is_some() {
            tracing::warn!(plugin = %self.entry.identifier(), "Plugin entry consumer dropped before close, aborting");
            self.abort();
        }
    }
}
