//! [`SiteFixture`] builder for local update sites.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use url::Url;

use update_model::manifest::{
    FEATURE_MANIFEST, SITE_MANIFEST, SiteFeatureSection, SiteManifest, render_feature_manifest,
    render_site_manifest,
};
use update_model::{Feature, PluginEntry};

use crate::archive::write_tar;

/// A temporary directory laid out as an update site: a `site.toml`
/// catalog, `features/<id>_<version>/feature.toml` manifests and
/// `plugins/<id>_<version>.jar` archives.
///
/// # Example
///
/// ```rust,no_run
/// use update_model::Feature;
/// use update_test_utils::{SiteFixture, vid1};
///
/// let mut site = SiteFixture::new();
/// site.add_feature(&Feature::builder(vid1("org.example.core")).build().unwrap());
/// let url = site.url();
/// ```
pub struct SiteFixture {
    temp_dir: TempDir,
    catalog: SiteManifest,
}

impl Default for SiteFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteFixture {
    pub fn new() -> Self {
        let fixture = Self {
            temp_dir: TempDir::new().unwrap(),
            catalog: SiteManifest::default(),
        };
        fixture.write_catalog();
        fixture
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// `file:` URL of the site directory, with a trailing slash.
    pub fn url(&self) -> Url {
        Url::from_directory_path(self.root()).unwrap()
    }

    /// Publish `feature`: its manifest, a catalog entry, and a default
    /// archive for every plugin that has none yet.
    pub fn add_feature(&mut self, feature: &Feature) -> &mut Self {
        let dir = feature.install_dir();
        let manifest = self.root().join(&dir).join(FEATURE_MANIFEST);
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(&manifest, render_feature_manifest(feature).unwrap()).unwrap();

        self.catalog.features.push(SiteFeatureSection {
            url: format!("{dir}/{FEATURE_MANIFEST}"),
            id: Some(feature.identifier().id().to_string()),
            version: Some(feature.identifier().version().to_string()),
            categories: Vec::new(),
            feature_type: None,
            environment: feature.environment().clone(),
        });
        self.write_catalog();

        for entry in feature.plugins() {
            if !self.plugin_path(entry).exists() {
                self.add_plugin_archive(entry, &[("plugin.toml", entry.identifier().to_string().as_str())]);
            }
        }
        self
    }

    /// Location of `entry`'s archive in this site.
    pub fn plugin_path(&self, entry: &PluginEntry) -> PathBuf {
        self.root().join(entry.archive_id())
    }

    /// Write (or replace) the archive of `entry`.
    pub fn add_plugin_archive(&self, entry: &PluginEntry, entries: &[(&str, &str)]) -> PathBuf {
        let path = self.plugin_path(entry);
        write_tar(&path, entries);
        path
    }

    /// Write a non-plugin file of `feature`.
    pub fn add_data(&self, feature: &Feature, name: &str, content: &str) -> PathBuf {
        let path = self.root().join(feature.install_dir()).join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Remove a published archive, e.g. to simulate a broken site.
    pub fn remove_plugin_archive(&self, entry: &PluginEntry) {
        fs::remove_file(self.plugin_path(entry)).unwrap();
    }

    fn write_catalog(&self) {
        let content = render_site_manifest(&self.catalog).unwrap();
        fs::write(self.root().join(SITE_MANIFEST), content).unwrap();
    }
}
