//! Snapshots of the configured sites and the activities that produced them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::configured_site::ConfiguredSite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityAction {
    FeatureInstall,
    FeatureRemove,
    SiteInstall,
    SiteRemove,
    Configure,
    Unconfigure,
    Revert,
    Reconciliation,
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FeatureInstall => "feature-install",
            Self::FeatureRemove => "feature-remove",
            Self::SiteInstall => "site-install",
            Self::SiteRemove => "site-remove",
            Self::Configure => "configure",
            Self::Unconfigure => "unconfigure",
            Self::Revert => "revert",
            Self::Reconciliation => "reconciliation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityStatus {
    #[default]
    Ok,
    Nok,
}

/// Audit entry attached to an [`InstallConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationActivity {
    pub action: ActivityAction,
    pub label: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub status: ActivityStatus,
}

impl ConfigurationActivity {
    pub fn new(action: ActivityAction, label: impl Into<String>) -> Self {
        Self {
            action,
            label: label.into(),
            date: Utc::now(),
            status: ActivityStatus::Ok,
        }
    }

    pub fn failed(mut self) -> Self {
        self.status = ActivityStatus::Nok;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ActivityStatus::Ok
    }
}

/// The configured sites of an installation at one point in time.
///
/// A configuration is never changed once it has been superseded; changes
/// are made on a [`successor`](Self::successor) and appended to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfiguration {
    id: Uuid,
    timestamp: DateTime<Utc>,
    label: String,
    #[serde(default)]
    sites: Vec<ConfiguredSite>,
    #[serde(default)]
    activities: Vec<ConfigurationActivity>,
}

impl InstallConfiguration {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            label: label.into(),
            sites: Vec::new(),
            activities: Vec::new(),
        }
    }

    /// A fresh configuration with the same sites and no activities.
    pub fn successor(&self, label: impl Into<String>) -> Self {
        Self {
            sites: self.sites.clone(),
            ..Self::new(label)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sites(&self) -> &[ConfiguredSite] {
        &self.sites
    }

    pub fn site(&self, url: &Url) -> Option<&ConfiguredSite> {
        self.sites.iter().find(|site| site.url() == url)
    }

    pub fn site_mut(&mut self, url: &Url) -> Option<&mut ConfiguredSite> {
        self.sites.iter_mut().find(|site| site.url() == url)
    }

    /// The one site new features may be written into.
    pub fn install_site(&self) -> Option<&ConfiguredSite> {
        self.sites.iter().find(|site| site.is_install_site())
    }

    /// Add or replace the site with the same URL.
    ///
    /// Adding an install site demotes any previous one.
    pub fn add_site(&mut self, site: ConfiguredSite) {
        if site.is_install_site() {
            for other in &mut self.sites {
                other.set_install_site(false);
            }
        }
        match self.sites.iter_mut().find(|s| s.url() == site.url()) {
            Some(existing) => *existing = site,
            None => self.sites.push(site),
        }
    }

    pub fn remove_site(&mut self, url: &Url) -> Option<ConfiguredSite> {
        let position = self.sites.iter().position(|site| site.url() == url)?;
        Some(self.sites.remove(position))
    }

    pub fn add_activity(&mut self, activity: ConfigurationActivity) {
        tracing::debug!(action = %activity.action, label = %activity.label, "Recording configuration activity");
        self.activities.push(activity);
    }

    pub fn activities(&self) -> &[ConfigurationActivity] {
        &self.activities
    }
}
