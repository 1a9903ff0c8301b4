//! Sites: where features and plugin archives physically live.
//!
//! A site is either a local directory (`file:` URL) that accepts stored
//! content, or a remote tree that can only be read. Layout relative to the
//! site root:
//!
//! ```text
//! site.toml                          optional catalog
//! features/<id>_<version>/feature.toml
//! plugins/<id>_<version>.jar         packed plugin (tar archive)
//! plugins/<id>_<version>/            unpacked plugin
//! ```
//!
//! The plugin registry and the feature list change as content is installed
//! and removed; everything else is fixed when the site is built.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use url::Url;

use crate::content::ContentReference;
use crate::error::{Error, Result};
use crate::feature::{DataEntry, Feature};
use crate::plugin::PluginEntry;
use crate::reference::{FeatureReference, FeatureResolver};
use crate::version::VersionedIdentifier;

/// Capabilities of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// Local directory; readable and storable.
    File,
    /// Remote tree; read-only for install purposes.
    Remote,
}

impl SiteKind {
    pub fn is_storable(&self) -> bool {
        matches!(self, Self::File)
    }
}

/// Explicit location of an archive, overriding the default layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReference {
    pub id: String,
    pub url: Url,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
}

/// A source of features.
pub struct Site {
    url: Url,
    kind: SiteKind,
    label: Option<String>,
    root: Option<PathBuf>,
    archives: BTreeMap<String, ArchiveReference>,
    categories: BTreeMap<String, Category>,
    resolver: Arc<dyn FeatureResolver>,
    plugins: RwLock<BTreeMap<VersionedIdentifier, PluginEntry>>,
    features: RwLock<Vec<FeatureReference>>,
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("url", &self.url.as_str())
            .field("kind", &self.kind)
            .field("plugins", &self.plugins.read().map(|p| p.len()).unwrap_or_default())
            .field("features", &self.features.read().map(|f| f.len()).unwrap_or_default())
            .finish()
    }
}

impl Site {
    pub fn builder(url: Url, kind: SiteKind, resolver: Arc<dyn FeatureResolver>) -> SiteBuilder {
        SiteBuilder::new(url, kind, resolver)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> SiteKind {
        self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_storable(&self) -> bool {
        self.kind.is_storable() && self.root.is_some()
    }

    /// Local directory backing the site, if any.
    pub fn local_root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Directory that stored content goes into.
    pub fn store_root(&self) -> Result<&Path> {
        match (&self.root, self.kind.is_storable()) {
            (Some(root), true) => Ok(root),
            _ => Err(Error::NotStorable {
                url: self.url.to_string(),
            }),
        }
    }

    pub fn resolver(&self) -> Arc<dyn FeatureResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn archive(&self, id: &str) -> Option<&ArchiveReference> {
        self.archives.get(id)
    }

    /// URL of an archive: the explicit mapping if declared, else the
    /// archive id resolved against the site URL.
    pub fn archive_url(&self, id: &str) -> Result<Url> {
        if let Some(archive) = self.archives.get(id) {
            return Ok(archive.url.clone());
        }
        self.url.join(id).map_err(|source| Error::InvalidUrl {
            url: format!("{}{id}", self.url),
            source,
        })
    }

    // Plugin registry

    pub fn plugin_entries(&self) -> Vec<PluginEntry> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn has_plugin(&self, identifier: &VersionedIdentifier) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(identifier)
    }

    /// Installed versions of a plugin id, lowest first.
    pub fn plugins_with_id(&self, id: &str) -> Vec<PluginEntry> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.id() == id)
            .cloned()
            .collect()
    }

    /// Register a plugin. Returns `false` if it was already registered.
    pub fn add_plugin_entry(&self, entry: PluginEntry) -> bool {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        if plugins.contains_key(entry.identifier()) {
            return false;
        }
        plugins.insert(entry.identifier().clone(), entry);
        true
    }

    pub fn remove_plugin_entry(&self, identifier: &VersionedIdentifier) -> Option<PluginEntry> {
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identifier)
    }

    // Feature references

    pub fn feature_references(&self) -> Vec<FeatureReference> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a reference unless one with the same URL exists.
    pub fn add_feature_reference(&self, reference: FeatureReference) -> bool {
        let mut features = self.features.write().unwrap_or_else(PoisonError::into_inner);
        if features.contains(&reference) {
            return false;
        }
        features.push(reference);
        true
    }

    pub fn remove_feature_reference(&self, url: &Url) -> Option<FeatureReference> {
        let mut features = self.features.write().unwrap_or_else(PoisonError::into_inner);
        let idx = features.iter().position(|r| r.url() == url)?;
        Some(features.remove(idx))
    }

    /// Find a listed feature by identifier.
    ///
    /// References whose identifier cannot be determined are skipped.
    pub fn find_feature(&self, identifier: &VersionedIdentifier) -> Option<FeatureReference> {
        self.feature_references()
            .into_iter()
            .find(|reference| reference.identifier().is_ok_and(|id| &id == identifier))
    }

    /// Manifest URL of a feature in this site's layout.
    pub fn feature_manifest_url(&self, identifier: &VersionedIdentifier) -> Result<Url> {
        let relative = format!("features/{}/feature.toml", identifier.path_name());
        self.url.join(&relative).map_err(|source| Error::InvalidUrl {
            url: relative,
            source,
        })
    }

    // Content references

    /// Where the archive of `entry` can be read from.
    pub fn plugin_content(&self, entry: &PluginEntry) -> Result<ContentReference> {
        let id = entry.archive_id();
        let checksum = self.archives.get(&id).and_then(|a| a.checksum.clone());
        let explicit = self.archives.contains_key(&id);

        let reference = match (&self.root, explicit) {
            (Some(root), false) => ContentReference::local(&id, root.join(&id)),
            _ => {
                let url = self.archive_url(&id)?;
                match url.to_file_path() {
                    Ok(path) if url.scheme() == "file" => ContentReference::local(&id, path),
                    _ => ContentReference::remote(&id, url),
                }
            }
        };
        Ok(reference
            .with_size(entry.download_size())
            .with_checksum(checksum))
    }

    /// Where a feature's non-plugin file can be read from.
    pub fn data_content(&self, feature: &Feature, data: &DataEntry) -> Result<ContentReference> {
        let id = format!("{}/{}", feature.install_dir(), data.name);
        let reference = match &self.root {
            Some(root) => ContentReference::local(&id, root.join(&id)),
            None => ContentReference::remote(&id, self.archive_url(&id)?),
        };
        Ok(reference.with_size(data.download_size))
    }
}

/// Assembles a [`Site`].
pub struct SiteBuilder {
    url: Url,
    kind: SiteKind,
    label: Option<String>,
    root: Option<PathBuf>,
    archives: BTreeMap<String, ArchiveReference>,
    categories: BTreeMap<String, Category>,
    resolver: Arc<dyn FeatureResolver>,
    plugins: BTreeMap<VersionedIdentifier, PluginEntry>,
    features: Vec<FeatureReference>,
}

impl SiteBuilder {
    fn new(url: Url, kind: SiteKind, resolver: Arc<dyn FeatureResolver>) -> Self {
        let root = if url.scheme() == "file" {
            url.to_file_path().ok()
        } else {
            None
        };
        Self {
            url: directory_url(url),
            kind,
            label: None,
            root,
            archives: BTreeMap::new(),
            categories: BTreeMap::new(),
            resolver,
            plugins: BTreeMap::new(),
            features: Vec::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn resolver(&self) -> Arc<dyn FeatureResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn archive(mut self, archive: ArchiveReference) -> Self {
        self.archives.insert(archive.id.clone(), archive);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.categories.insert(category.name.clone(), category);
        self
    }

    pub fn plugin(mut self, entry: PluginEntry) -> Self {
        self.plugins.insert(entry.identifier().clone(), entry);
        self
    }

    pub fn feature(mut self, reference: FeatureReference) -> Self {
        if !self.features.contains(&reference) {
            self.features.push(reference);
        }
        self
    }

    pub fn build(self) -> Site {
        Site {
            url: self.url,
            kind: self.kind,
            label: self.label,
            root: self.root,
            archives: self.archives,
            categories: self.categories,
            resolver: self.resolver,
            plugins: RwLock::new(self.plugins),
            features: RwLock::new(self.features),
        }
    }
}

/// Ensure the URL path ends with `/` so relative joins stay inside the site.
pub fn directory_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceMetadata;

    struct NoResolver;

    impl FeatureResolver for NoResolver {
        fn resolve(&self, url: &Url) -> Result<Feature> {
            Err(Error::UnknownFeature(url.to_string()))
        }
    }

    fn vid(id: &str, version: &str) -> VersionedIdentifier {
        VersionedIdentifier::parse(id, version).unwrap()
    }

    fn remote_site() -> Site {
        Site::builder(
            Url::parse("https://updates.example.org/releases").unwrap(),
            SiteKind::Remote,
            Arc::new(NoResolver),
        )
        .archive(ArchiveReference {
            id: "plugins/b_1.0.0.jar".into(),
            url: Url::parse("https://mirror.example.org/b.jar").unwrap(),
            checksum: Some("sha256:abc".into()),
        })
        .build()
    }

    #[test]
    fn urls_are_treated_as_directories() {
        let site = remote_site();
        assert_eq!(site.url().as_str(), "https://updates.example.org/releases/");
        assert_eq!(
            site.feature_manifest_url(&vid("a", "1.0")).unwrap().as_str(),
            "https://updates.example.org/releases/features/a_1.0.0/feature.toml"
        );
    }

    #[test]
    fn archive_mapping_overrides_layout() {
        let site = remote_site();
        let mapped = site
            .plugin_content(&PluginEntry::new(vid("b", "1.0")))
            .unwrap();
        assert_eq!(mapped.checksum(), Some("sha256:abc"));
        assert!(mapped.is_remote());

        let default = site
            .plugin_content(&PluginEntry::new(vid("a", "1.0")))
            .unwrap();
        assert_eq!(
            default.source(),
            &crate::content::ContentSource::Remote(
                Url::parse("https://updates.example.org/releases/plugins/a_1.0.0.jar").unwrap()
            )
        );
    }

    #[test]
    fn remote_sites_are_not_storable() {
        let site = remote_site();
        assert!(!site.is_storable());
        assert!(matches!(site.store_root(), Err(Error::NotStorable { .. })));
    }

    #[test]
    fn file_sites_store_into_their_root() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(dir.path()).unwrap();
        let site = Site::builder(url, SiteKind::File, Arc::new(NoResolver)).build();

        assert_eq!(site.store_root().unwrap(), dir.path());
        let content = site.plugin_content(&PluginEntry::new(vid("a", "1.0"))).unwrap();
        assert_eq!(
            content.source(),
            &crate::content::ContentSource::Local(dir.path().join("plugins/a_1.0.0.jar"))
        );
    }

    #[test]
    fn plugin_registry_rejects_duplicates() {
        let site = remote_site();
        let entry = PluginEntry::new(vid("p", "1.0"));
        assert!(site.add_plugin_entry(entry.clone()));
        assert!(!site.add_plugin_entry(entry.clone()));
        site.add_plugin_entry(PluginEntry::new(vid("p", "2.0")));

        let versions: Vec<_> = site
            .plugins_with_id("p")
            .iter()
            .map(|e| e.version().to_string())
            .collect();
        assert_eq!(versions, vec!["1.0.0", "2.0.0"]);

        assert!(site.remove_plugin_entry(entry.identifier()).is_some());
        assert!(!site.has_plugin(entry.identifier()));
    }

    #[test]
    fn feature_references_are_unique_by_url() {
        let site = remote_site();
        let url = site.feature_manifest_url(&vid("a", "1.0")).unwrap();
        let reference = FeatureReference::new(
            site.url().clone(),
            url.clone(),
            ReferenceMetadata {
                identifier: Some(vid("a", "1.0")),
                ..Default::default()
            },
            site.resolver(),
        );

        assert!(site.add_feature_reference(reference.clone()));
        assert!(!site.add_feature_reference(reference));
        assert!(site.find_feature(&vid("a", "1.0")).is_some());
        assert!(site.remove_feature_reference(&url).is_some());
        assert!(site.feature_references().is_empty());
    }
}
