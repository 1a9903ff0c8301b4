//! Configure, unconfigure and revert.

use std::collections::BTreeSet;
use std::sync::Arc;

use url::Url;

use update_model::site::directory_url;
use update_model::{Feature, FeatureReference, Site, VersionedIdentifier};

use super::UpdateEngine;
use crate::configuration::{ActivityAction, ConfigurationActivity, InstallConfiguration};
use crate::{Error, Result};

impl UpdateEngine {
    /// Configure `reference` on `site_url` together with its installed,
    /// applicable included features, children first.
    ///
    /// Optional children are configured only when they are installed on
    /// the site. A missing required child is logged and left out.
    pub fn configure(&self, reference: &FeatureReference, site_url: &Url) -> Result<InstallConfiguration> {
        let key = directory_url(site_url.clone());
        let site = self.resolve(&key)?;
        let feature = reference.feature()?;

        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        self.configure_order(&site, &feature, &mut visited, &mut order);
        tracing::info!(feature = %feature.identifier(), site = %key, features = order.len(), "Configuring feature");

        self.commit(
            format!("configure {}", feature.identifier()),
            ConfigurationActivity::new(ActivityAction::Configure, feature.identifier().to_string()),
            |config| {
                let binding = config
                    .site_mut(&key)
                    .ok_or_else(|| Error::UnknownSite(key.to_string()))?;
                for id in order {
                    binding.configure(id);
                }
                Ok(())
            },
        )
    }

    fn configure_order(
        &self,
        site: &Site,
        feature: &Feature,
        visited: &mut BTreeSet<VersionedIdentifier>,
        order: &mut Vec<VersionedIdentifier>,
    ) {
        if !visited.insert(feature.identifier().clone()) {
            return;
        }
        let env = self.ctx.environment();
        for include in feature.includes() {
            if !include.environment.applies(env) {
                continue;
            }
            let Some(child) = site.find_feature(&include.identifier) else {
                if !include.optional {
                    tracing::warn!(
                        parent = %feature.identifier(),
                        child = %include.identifier,
                        "Included feature is not installed on the site"
                    );
                }
                continue;
            };
            match child.feature() {
                Ok(child) => self.configure_order(site, &child, visited, order),
                Err(e) => tracing::warn!(child = %include.identifier, error = %e, "Could not resolve included feature"),
            }
        }
        order.push(feature.identifier().clone());
    }

    /// Unconfigure `reference` on `site_url`.
    ///
    /// Patches of it configured on any site are unconfigured too, as are
    /// its included features that no other configured feature of the
    /// site still includes.
    pub fn unconfigure(&self, reference: &FeatureReference, site_url: &Url) -> Result<InstallConfiguration> {
        let key = directory_url(site_url.clone());
        let site = self.resolve(&key)?;
        let feature = reference.feature()?;
        let base = feature.identifier().clone();
        let config = self.current_configuration();
        let binding = config
            .site(&key)
            .ok_or_else(|| Error::UnknownSite(key.to_string()))?;

        let mut targets: Vec<(Url, VersionedIdentifier)> = vec![(key.clone(), base.clone())];

        for other in config.sites() {
            let other_site = match self.resolve(other.url()) {
                Ok(site) => site,
                Err(e) => {
                    tracing::warn!(site = %other.url(), error = %e, "Skipping unreachable configured site");
                    continue;
                }
            };
            for candidate in other.configured_features(&other_site) {
                if let Ok(patch) = candidate.feature()
                    && patch.is_patch_of(&base)
                {
                    targets.push((other.url().clone(), patch.identifier().clone()));
                }
            }
        }

        let configured: Vec<Arc<Feature>> = binding
            .configured_features(&site)
            .iter()
            .filter_map(|r| r.feature().ok())
            .collect();
        let mut removing: BTreeSet<VersionedIdentifier> = BTreeSet::from([base.clone()]);
        let mut pending = vec![feature];
        while let Some(parent) = pending.pop() {
            for include in parent.includes() {
                let child = &include.identifier;
                if removing.contains(child) || !binding.is_configured(child) {
                    continue;
                }
                let still_included = configured.iter().any(|other| {
                    !removing.contains(other.identifier())
                        && other.includes().iter().any(|i| &i.identifier == child)
                });
                if still_included {
                    continue;
                }
                removing.insert(child.clone());
                targets.push((key.clone(), child.clone()));
                if let Some(resolved) = site.find_feature(child).and_then(|r| r.feature().ok()) {
                    pending.push(resolved);
                }
            }
        }

        tracing::info!(feature = %base, site = %key, features = targets.len(), "Unconfiguring feature");
        self.commit(
            format!("unconfigure {base}"),
            ConfigurationActivity::new(ActivityAction::Unconfigure, base.to_string()),
            |config| {
                for (url, id) in targets {
                    if let Some(binding) = config.site_mut(&url) {
                        binding.unconfigure(id);
                    }
                }
                Ok(())
            },
        )
    }

    /// Make the snapshot at `index` current again, as a new snapshot.
    ///
    /// Sites in both snapshots get the old snapshot's feature states for
    /// every feature the history has seen on them. Sites only in the
    /// current snapshot have all their features unconfigured. Sites only
    /// in the old snapshot are added back unchanged.
    pub fn revert(&self, index: usize) -> Result<InstallConfiguration> {
        let mut history = self.history();
        let target = history
            .get(index)
            .cloned()
            .ok_or(Error::UnknownSnapshot { index })?;
        let current = history
            .current()
            .cloned()
            .unwrap_or_else(|| InstallConfiguration::new("empty"));

        let mut next = current.successor(format!("revert to {}", target.label()));
        for existing in current.sites() {
            let url = existing.url().clone();
            let mut seen = history.features_seen_on(&url);
            seen.extend(existing.policy().known());

            match target.site(&url) {
                Some(snapshot) => {
                    let mut binding = snapshot.clone();
                    for id in seen {
                        if snapshot.is_configured(&id) {
                            binding.configure(id);
                        } else {
                            binding.unconfigure(id);
                        }
                    }
                    next.add_site(binding);
                }
                None => {
                    match self.resolve(&url) {
                        Ok(site) => seen.extend(site.feature_references().iter().filter_map(|r| r.identifier().ok())),
                        Err(e) => tracing::warn!(site = %url, error = %e, "Reverting site without resolving it"),
                    }
                    if let Some(binding) = next.site_mut(&url) {
                        for id in seen {
                            binding.unconfigure(id);
                        }
                    }
                }
            }
        }
        for snapshot in target.sites() {
            if current.site(snapshot.url()).is_none() {
                next.add_site(snapshot.clone());
            }
        }

        next.add_activity(ConfigurationActivity::new(ActivityAction::Revert, target.id().to_string()));
        history.push(next.clone());
        history.save()?;
        tracing::info!(index, target = %target.id(), configuration = %next.id(), "Reverted configuration");
        Ok(next)
    }
}
