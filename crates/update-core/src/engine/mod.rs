//! The update engine: site resolution, install and remove batches,
//! configuration changes and history.
//!
//! Every public operation works on the current [`InstallConfiguration`] and,
//! when it changes anything, appends a successor to the
//! [`ConfigurationHistory`] and saves it before returning.

mod batch;
mod configure;
mod install;

pub use batch::{BatchReport, InstallOptions, UnitOutcome, UnitStatus};
pub use install::DOWNLOAD_DIR;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use url::Url;

use update_model::site::directory_url;
use update_model::{
    Feature, FeatureReference, FilterReport, PatchedFeature, Site, filter_applicable,
};

use crate::configuration::{
    ActivityAction, ConfigurationActivity, ConfigurationHistory, ConfiguredSite, FeatureStatus,
    HISTORY_FILE, InstallConfiguration, PolicyKind,
};
use crate::recovery::RecoveryReport;
use crate::transaction::{InstallTransaction, RemoveTransaction};
use crate::{Error, Result, UpdateContext};

/// Entry point for resolving sites and changing an installation.
///
/// Resolved sites are cached by directory URL for the life of the engine,
/// so registry changes made by transactions stay visible to later calls.
pub struct UpdateEngine {
    ctx: UpdateContext,
    sites: RwLock<BTreeMap<Url, Arc<Site>>>,
    history: Mutex<ConfigurationHistory>,
}

impl fmt::Debug for UpdateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEngine")
            .field("install_root", self.ctx.install_root())
            .finish_non_exhaustive()
    }
}

impl UpdateEngine {
    /// Load the configuration history of `ctx`'s installation.
    ///
    /// A fresh installation gets an initial configuration whose install
    /// site is the installation directory itself.
    pub fn new(ctx: UpdateContext) -> Result<Self> {
        let root = ctx.install_root().to_native();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;

        let mut history = ConfigurationHistory::load(
            ctx.state_dir().join(HISTORY_FILE),
            ctx.settings().history_size,
            ctx.settings().robustness(),
        )?;

        if history.is_empty() {
            let url = Url::from_directory_path(&root).map_err(|()| Error::NotInstallable {
                site: root.display().to_string(),
            })?;
            let mut initial = InstallConfiguration::new("initial configuration");
            initial.add_site(ConfiguredSite::new(url.clone(), PolicyKind::UserInclude).as_install_site(true));
            initial.add_activity(ConfigurationActivity::new(ActivityAction::SiteInstall, url.as_str()));
            history.push(initial);
            history.save()?;
            tracing::info!(install_site = %url, "Created initial configuration");
        }

        Ok(Self {
            ctx,
            sites: RwLock::new(BTreeMap::new()),
            history: Mutex::new(history),
        })
    }

    pub fn context(&self) -> &UpdateContext {
        &self.ctx
    }

    fn history(&self) -> MutexGuard<'_, ConfigurationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The newest configuration snapshot.
    pub fn current_configuration(&self) -> InstallConfiguration {
        self.history()
            .current()
            .cloned()
            .unwrap_or_else(|| InstallConfiguration::new("empty"))
    }

    /// Every snapshot, oldest first.
    pub fn snapshots(&self) -> Vec<InstallConfiguration> {
        self.history().snapshots().to_vec()
    }

    /// Resolve `url` through the site registry, reusing a cached site.
    pub fn resolve(&self, url: &Url) -> Result<Arc<Site>> {
        let key = directory_url(url.clone());
        if let Some(site) = self
            .sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(site));
        }

        let site = Arc::new(self.ctx.registry().resolve(&key)?);
        tracing::info!(
            site = %key,
            features = site.feature_references().len(),
            plugins = site.plugin_entries().len(),
            "Resolved site"
        );
        let mut sites = self.sites.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(sites.entry(key).or_insert(site)))
    }

    /// Forget a cached site so the next [`resolve`](Self::resolve) reads it again.
    pub fn invalidate(&self, url: &Url) {
        let key = directory_url(url.clone());
        self.sites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    /// Append a successor of the current configuration changed by `change`.
    ///
    /// Nothing is recorded when `change` fails.
    fn commit<F>(&self, label: String, activity: ConfigurationActivity, change: F) -> Result<InstallConfiguration>
    where
        F: FnOnce(&mut InstallConfiguration) -> Result<()>,
    {
        let mut history = self.history();
        let mut next = match history.current() {
            Some(current) => current.successor(label),
            None => InstallConfiguration::new(label),
        };
        change(&mut next)?;
        next.add_activity(activity);
        history.push(next.clone());
        history.save()?;
        tracing::debug!(configuration = %next.id(), label = next.label(), "Recorded configuration");
        Ok(next)
    }

    /// Add or replace a configured site binding.
    ///
    /// Making it the install site demotes the previous one.
    pub fn add_configured_site(&self, url: &Url, kind: PolicyKind, install_site: bool) -> Result<InstallConfiguration> {
        let key = directory_url(url.clone());
        let site = self.resolve(&key)?;
        if install_site && !site.is_storable() {
            return Err(Error::NotInstallable { site: key.to_string() });
        }
        let binding = ConfiguredSite::new(key.clone(), kind).as_install_site(install_site);
        self.commit(
            format!("add site {key}"),
            ConfigurationActivity::new(ActivityAction::SiteInstall, key.as_str()),
            |config| {
                config.add_site(binding);
                Ok(())
            },
        )
    }

    /// Drop a configured site binding. The site's files are untouched.
    pub fn remove_configured_site(&self, url: &Url) -> Result<InstallConfiguration> {
        let key = directory_url(url.clone());
        self.commit(
            format!("remove site {key}"),
            ConfigurationActivity::new(ActivityAction::SiteRemove, key.as_str()),
            |config| {
                config
                    .remove_site(&key)
                    .map(|_| ())
                    .ok_or_else(|| Error::UnknownSite(key.to_string()))
            },
        )
    }

    fn configured_site(&self, url: &Url) -> Result<(Url, ConfiguredSite)> {
        let key = directory_url(url.clone());
        let config = self.current_configuration();
        let site = config
            .site(&key)
            .cloned()
            .ok_or_else(|| Error::UnknownSite(key.to_string()))?;
        Ok((key, site))
    }

    /// Group `reference` with the patches for it among the configured
    /// features of every enabled configured site.
    pub fn patched_feature(&self, reference: &FeatureReference) -> Result<PatchedFeature> {
        let base = reference.identifier()?;
        let mut patched = PatchedFeature::new(reference.clone());

        for binding in self.current_configuration().sites() {
            if !binding.is_enabled() {
                continue;
            }
            let site = match self.resolve(binding.url()) {
                Ok(site) => site,
                Err(e) => {
                    tracing::warn!(site = %binding.url(), error = %e, "Skipping unreachable configured site");
                    continue;
                }
            };
            for candidate in binding.configured_features(&site) {
                match candidate.feature() {
                    Ok(feature) if feature.is_patch_of(&base) => {
                        if patched.add_patch(candidate.clone()) {
                            tracing::debug!(base = %base, patch = %feature.identifier(), "Found patch");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(reference = %candidate, error = %e, "Could not resolve configured feature"),
                }
            }
        }
        Ok(patched)
    }

    /// Features of `site` that apply to this platform.
    ///
    /// References are filtered on their catalog metadata first and then on
    /// the resolved manifest. Unresolvable references are left out and
    /// logged.
    pub fn available_features(&self, site: &Site) -> (Vec<FeatureReference>, FilterReport) {
        let env = self.ctx.environment();
        let (candidates, mut report) = filter_applicable(site.feature_references(), env);

        let mut available = Vec::new();
        for reference in candidates {
            match reference.feature() {
                Ok(feature) => {
                    let (kept, excluded) = filter_applicable(std::iter::once(feature), env);
                    report.merge(excluded);
                    if !kept.is_empty() {
                        available.push(reference);
                    }
                }
                Err(e) => tracing::warn!(reference = %reference, error = %e, "Leaving out unresolvable feature"),
            }
        }

        if !report.is_empty() {
            tracing::info!(
                site = %site.url(),
                excluded = report.excluded.len(),
                available = available.len(),
                "Filtered features for this platform"
            );
        }
        (available, report)
    }

    /// Open an install of `feature` into the configured install site at `site_url`.
    pub fn begin_install(&self, feature: Arc<Feature>, site_url: &Url) -> Result<InstallTransaction<'_>> {
        let (key, binding) = self.configured_site(site_url)?;
        if !binding.is_install_site() {
            return Err(Error::NotInstallable { site: key.to_string() });
        }
        let site = self.resolve(&key)?;
        InstallTransaction::begin(&self.ctx, feature, site)
    }

    /// Open the removal of an unconfigured feature from `site_url`.
    pub fn begin_remove(&self, feature: Arc<Feature>, site_url: &Url) -> Result<RemoveTransaction<'_>> {
        let (key, binding) = self.configured_site(site_url)?;
        if binding.is_configured(feature.identifier()) {
            return Err(Error::FeatureConfigured {
                feature: feature.identifier().to_string(),
            });
        }
        let site = self.resolve(&key)?;
        RemoveTransaction::begin(&self.ctx, feature, site)
    }

    /// Configured features of `site_url` with their plugin status.
    pub fn feature_statuses(&self, site_url: &Url) -> Result<Vec<FeatureStatus>> {
        let (key, binding) = self.configured_site(site_url)?;
        let site = self.resolve(&key)?;
        Ok(binding.feature_statuses(&site, self.ctx.environment()))
    }

    /// Replay and sweep the recovery log now.
    ///
    /// Cached sites are dropped, since the sweep may have removed files
    /// they describe.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.ctx.recover()?;
        self.sites.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(report)
    }
}
