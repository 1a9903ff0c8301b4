//! Site-type registry.
//!
//! Maps a URL scheme (or explicit site type) to the factory that builds
//! sites of that kind. The `file` factory is built in; remote factories are
//! registered by the layer that owns the network client.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::manifest::{FEATURE_MANIFEST, SITE_MANIFEST, parse_site_manifest, read_feature_manifest};
use crate::plugin::PluginEntry;
use crate::reference::{FeatureReference, FeatureResolver, ReferenceMetadata};
use crate::site::{Site, SiteKind};
use crate::version::VersionedIdentifier;

/// Builds a [`Site`] for a URL.
pub trait SiteFactory: Send + Sync {
    fn create(&self, url: &Url) -> Result<Site>;
}

/// Registry of site factories keyed by scheme or type name.
#[derive(Clone, Default)]
pub struct SiteTypeRegistry {
    factories: HashMap<String, Arc<dyn SiteFactory>>,
}

impl std::fmt::Debug for SiteTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteTypeRegistry")
            .field("types", &self.known_types())
            .finish()
    }
}

impl SiteTypeRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `file` factory.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", Arc::new(FileSiteFactory));
        registry
    }

    pub fn register(&mut self, site_type: impl Into<String>, factory: Arc<dyn SiteFactory>) {
        self.factories.insert(site_type.into().to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, site_type: &str) -> bool {
        self.factories.contains_key(&site_type.to_ascii_lowercase())
    }

    /// Registered type names (sorted).
    pub fn known_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a site using the factory registered for the URL scheme.
    pub fn resolve(&self, url: &Url) -> Result<Site> {
        self.resolve_as(url.scheme(), url)
    }

    /// Build a site using the factory registered for `site_type`.
    pub fn resolve_as(&self, site_type: &str, url: &Url) -> Result<Site> {
        let factory = self
            .factories
            .get(&site_type.to_ascii_lowercase())
            .ok_or_else(|| Error::UnknownSiteType(site_type.to_string()))?;
        tracing::debug!(site_type, url = %url, "Resolving site");
        factory.create(url)
    }
}

/// Reads feature manifests from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFeatureResolver;

impl FeatureResolver for FileFeatureResolver {
    fn resolve(&self, manifest_url: &Url) -> Result<Feature> {
        let path = file_path(manifest_url)?;
        read_feature_manifest(&path)
    }
}

fn file_path(url: &Url) -> Result<PathBuf> {
    url.to_file_path()
        .map_err(|()| Error::UnknownSiteType(format!("{} (not a local path)", url)))
}

/// Builds sites backed by a local directory.
///
/// A `site.toml` catalog is honoured when present. Features and plugins
/// found on disk are always added, so an installation directory without a
/// catalog describes exactly what is installed in it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSiteFactory;

impl SiteFactory for FileSiteFactory {
    fn create(&self, url: &Url) -> Result<Site> {
        let root = file_path(url)?;
        if !root.is_dir() {
            return Err(Error::ManifestNotFound(root));
        }

        let mut builder = Site::builder(url.clone(), SiteKind::File, Arc::new(FileFeatureResolver));

        let catalog = root.join(SITE_MANIFEST);
        if catalog.is_file() {
            let content = update_fs::io::read_text(&update_fs::NormalizedPath::new(&catalog))?;
            let manifest = parse_site_manifest(&content, &catalog.display().to_string())?;
            builder = manifest.populate(builder)?;
        }

        let site_url = builder.url().clone();
        for (identifier, manifest) in scan_features(&root)? {
            let manifest_url = Url::from_file_path(&manifest)
                .map_err(|()| Error::ManifestNotFound(manifest.clone()))?;
            let metadata = ReferenceMetadata {
                identifier,
                ..ReferenceMetadata::default()
            };
            builder = builder.feature(FeatureReference::new(
                site_url.clone(),
                manifest_url,
                metadata,
                Arc::new(FileFeatureResolver),
            ));
        }

        for entry in scan_plugins(&root)? {
            builder = builder.plugin(entry);
        }

        Ok(builder.build())
    }
}

fn scan_features(root: &Path) -> Result<Vec<(Option<VersionedIdentifier>, PathBuf)>> {
    let features_dir = root.join("features");
    let mut found = Vec::new();
    for dir in sorted_entries(&features_dir)? {
        let manifest = dir.join(FEATURE_MANIFEST);
        if !manifest.is_file() {
            continue;
        }
        let identifier = dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| VersionedIdentifier::from_path_name(name).ok());
        found.push((identifier, manifest));
    }
    Ok(found)
}

fn scan_plugins(root: &Path) -> Result<Vec<PluginEntry>> {
    let plugins_dir = root.join("plugins");
    let mut found = Vec::new();
    for path in sorted_entries(&plugins_dir)? {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.ends_with(".tmp") {
            continue;
        }
        let (stem, unpacked) = if path.is_dir() {
            (name, true)
        } else if let Some(stem) = name.strip_suffix(".jar") {
            (stem, false)
        } else {
            continue;
        };
        match VersionedIdentifier::from_path_name(stem) {
            Ok(identifier) => found.push(PluginEntry::new(identifier).with_unpack(unpacked)),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "Ignoring unrecognized plugin entry"),
        }
    }
    Ok(found)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| update_fs::Error::io(dir, e))?;
    let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
    paths.sort();
    Ok(paths)
}
