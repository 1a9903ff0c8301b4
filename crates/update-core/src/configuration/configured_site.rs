//! A site bound into an installation.

use serde::{Deserialize, Serialize};
use update_model::{FeatureReference, PlatformEnvironment, Site, VersionedIdentifier};
use url::Url;

use super::policy::{ConfigurationPolicy, PolicyKind};

/// Local binding of a [`Site`] into an install configuration.
///
/// Holds the site by URL; the live [`Site`] is shared through the engine's
/// site cache and passed in where needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredSite {
    url: Url,
    #[serde(default)]
    policy: ConfigurationPolicy,
    #[serde(default)]
    install_site: bool,
    #[serde(default = "enabled_default")]
    enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// Health of one configured feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureStatus {
    pub feature: VersionedIdentifier,
    /// Applicable plugin entries missing from the site's plugin registry.
    pub missing_plugins: Vec<VersionedIdentifier>,
}

impl FeatureStatus {
    pub fn is_broken(&self) -> bool {
        !self.missing_plugins.is_empty()
    }
}

impl ConfiguredSite {
    pub fn new(url: Url, kind: PolicyKind) -> Self {
        Self {
            url,
            policy: ConfigurationPolicy::new(kind),
            install_site: false,
            enabled: true,
        }
    }

    pub fn as_install_site(mut self, install_site: bool) -> Self {
        self.install_site = install_site;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn policy(&self) -> &ConfigurationPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut ConfigurationPolicy {
        &mut self.policy
    }

    pub fn is_install_site(&self) -> bool {
        self.install_site
    }

    pub(crate) fn set_install_site(&mut self, install_site: bool) {
        self.install_site = install_site;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_configured(&self, feature: &VersionedIdentifier) -> bool {
        self.enabled && self.policy.is_configured(feature)
    }

    pub fn configure(&mut self, feature: VersionedIdentifier) -> bool {
        tracing::debug!(site = %self.url, feature = %feature, "Configuring feature");
        self.policy.configure(feature)
    }

    pub fn unconfigure(&mut self, feature: VersionedIdentifier) -> bool {
        tracing::debug!(site = %self.url, feature = %feature, "Unconfiguring feature");
        self.policy.unconfigure(feature)
    }

    /// Feature references of `site` that this binding activates.
    pub fn configured_features(&self, site: &Site) -> Vec<FeatureReference> {
        if !self.enabled {
            return Vec::new();
        }
        self.policy.filter_configured(&site.feature_references())
    }

    /// Status of every configured feature on `site`.
    ///
    /// A feature is broken when one of its plugins applicable to `env` is
    /// not registered on the site. Unresolvable features are reported with
    /// no plugin detail and logged.
    pub fn feature_statuses(&self, site: &Site, env: &PlatformEnvironment) -> Vec<FeatureStatus> {
        let mut statuses = Vec::new();
        for reference in self.configured_features(site) {
            let feature = match reference.feature() {
                Ok(feature) => feature,
                Err(e) => {
                    tracing::warn!(reference = %reference, error = %e, "Configured feature cannot be resolved");
                    continue;
                }
            };
            let missing_plugins: Vec<VersionedIdentifier> = feature
                .plugins()
                .iter()
                .filter(|entry| entry.environment().applies(env))
                .filter(|entry| !site.has_plugin(entry.identifier()))
                .map(|entry| entry.identifier().clone())
                .collect();
            if !missing_plugins.is_empty() {
                tracing::warn!(feature = %feature.identifier(), missing = missing_plugins.len(), "Configured feature is broken");
            }
            statuses.push(FeatureStatus {
                feature: feature.identifier().clone(),
                missing_plugins,
            });
        }
        statuses
    }

    pub fn broken_features(&self, site: &Site, env: &PlatformEnvironment) -> Vec<VersionedIdentifier> {
        self.feature_statuses(site, env)
            .into_iter()
            .filter(FeatureStatus::is_broken)
            .map(|status| status.feature)
            .collect()
    }
}
