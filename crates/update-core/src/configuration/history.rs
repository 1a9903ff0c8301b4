//! Persisted history of install configurations.

use std::collections::BTreeSet;
use std::fs::OpenOptions;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use update_fs::{ConfigStore, NormalizedPath, RobustnessConfig};
use update_model::VersionedIdentifier;
use url::Url;

use super::install_configuration::InstallConfiguration;
use crate::{Error, Result};

/// File name of the history below the state directory.
pub const HISTORY_FILE: &str = "history.toml";

const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryDocument {
    version: String,
    #[serde(default)]
    configuration: Vec<InstallConfiguration>,
}

/// Bounded, oldest-first list of install configurations.
///
/// The last entry is the current configuration. Saving writes a temp file
/// and renames it under an exclusive lock on a sibling `.lock` file;
/// loading holds a shared lock on the same file.
#[derive(Debug)]
pub struct ConfigurationHistory {
    path: NormalizedPath,
    capacity: usize,
    robustness: RobustnessConfig,
    snapshots: Vec<InstallConfiguration>,
}

impl ConfigurationHistory {
    pub fn new(path: NormalizedPath, capacity: usize, robustness: RobustnessConfig) -> Self {
        Self {
            path,
            capacity: capacity.max(1),
            robustness,
            snapshots: Vec::new(),
        }
    }

    /// Load the history at `path`; a missing file is an empty history.
    pub fn load(path: NormalizedPath, capacity: usize, robustness: RobustnessConfig) -> Result<Self> {
        let mut history = Self::new(path, capacity, robustness);
        if !history.path.is_file() {
            return Ok(history);
        }

        let lock_path = history.path.with_suffix(".lock").to_native();
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io(&lock_path, e))?;
        FileExt::lock_shared(&lock_file).map_err(|e| Error::io(&lock_path, e))?;

        let content = update_fs::io::read_text(&history.path)?;
        let document: HistoryDocument = ConfigStore::parse(&history.path, &content)?;
        drop(lock_file);

        if document.version != FORMAT_VERSION {
            return Err(Error::History {
                path: history.path.to_native(),
                message: format!("unsupported history version '{}'", document.version),
            });
        }
        history.snapshots = document.configuration;
        history.trim();
        tracing::debug!(path = %history.path, snapshots = history.snapshots.len(), "Loaded configuration history");
        Ok(history)
    }

    pub fn save(&self) -> Result<()> {
        let document = HistoryDocument {
            version: FORMAT_VERSION.to_string(),
            configuration: self.snapshots.clone(),
        };
        ConfigStore::with_robustness(self.robustness).save(&self.path, &document)?;
        tracing::debug!(path = %self.path, snapshots = self.snapshots.len(), "Saved configuration history");
        Ok(())
    }

    pub fn path(&self) -> &NormalizedPath {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `configuration` as the new current one, dropping the oldest
    /// entries beyond capacity.
    pub fn push(&mut self, configuration: InstallConfiguration) {
        self.snapshots.push(configuration);
        self.trim();
    }

    fn trim(&mut self) {
        if self.snapshots.len() > self.capacity {
            let excess = self.snapshots.len() - self.capacity;
            tracing::debug!(dropped = excess, "Trimming configuration history");
            self.snapshots.drain(..excess);
        }
    }

    pub fn current(&self) -> Option<&InstallConfiguration> {
        self.snapshots.last()
    }

    pub fn get(&self, index: usize) -> Option<&InstallConfiguration> {
        self.snapshots.get(index)
    }

    pub fn snapshots(&self) -> &[InstallConfiguration] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Every feature any retained configuration had an opinion about on
    /// the site at `url`.
    pub fn features_seen_on(&self, url: &Url) -> BTreeSet<VersionedIdentifier> {
        self.snapshots
            .iter()
            .filter_map(|config| config.site(url))
            .flat_map(|site| site.policy().known())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{ConfiguredSite, PolicyKind};
    use std::fs;
    use update_model::Version;

    fn history_in(dir: &std::path::Path, capacity: usize) -> ConfigurationHistory {
        ConfigurationHistory::new(
            NormalizedPath::new(dir.join(HISTORY_FILE)),
            capacity,
            RobustnessConfig::default(),
        )
    }

    #[test]
    fn trims_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = history_in(dir.path(), 2);
        for label in ["one", "two", "three"] {
            history.push(InstallConfiguration::new(label));
        }
        let labels: Vec<&str> = history.snapshots().iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["two", "three"]);
        assert_eq!(history.current().map(|c| c.label()), Some("three"));
    }

    #[test]
    fn save_and_load_preserve_configurations() {
        let dir = tempfile::tempdir().unwrap();
        let site_url = Url::parse("file:///install/").unwrap();
        let feature = VersionedIdentifier::new("f", Version::new(1, 0, 0));

        let mut config = InstallConfiguration::new("initial");
        let mut site = ConfiguredSite::new(site_url.clone(), PolicyKind::UserInclude).as_install_site(true);
        site.configure(feature.clone());
        config.add_site(site);

        let mut history = history_in(dir.path(), 5);
        history.push(config.clone());
        history.save().unwrap();

        let loaded = ConfigurationHistory::load(history.path().clone(), 5, RobustnessConfig::default()).unwrap();
        assert_eq!(loaded.snapshots(), &[config]);
        assert!(loaded.features_seen_on(&site_url).contains(&feature));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = ConfigurationHistory::load(
            NormalizedPath::new(dir.path().join(HISTORY_FILE)),
            3,
            RobustnessConfig::default(),
        )
        .unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        fs::write(&path, "version = \"9.9\"\n").unwrap();
        let err = ConfigurationHistory::load(NormalizedPath::new(&path), 3, RobustnessConfig::default()).unwrap_err();
        assert!(matches!(err, Error::History { .. }));
    }
}
