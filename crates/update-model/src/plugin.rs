//! Plugin entries declared by feature manifests.

use crate::environment::{Applicability, EnvironmentFilter};
use crate::version::{Version, VersionedIdentifier};

/// A plugin as declared by a feature, and as registered on a site once
/// installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEntry {
    identifier: VersionedIdentifier,
    label: Option<String>,
    download_size: Option<u64>,
    install_size: Option<u64>,
    environment: EnvironmentFilter,
    fragment: bool,
    unpack: bool,
    delta_base: Option<Version>,
}

impl PluginEntry {
    pub fn new(identifier: VersionedIdentifier) -> Self {
        Self {
            identifier,
            label: None,
            download_size: None,
            install_size: None,
            environment: EnvironmentFilter::default(),
            fragment: false,
            unpack: false,
            delta_base: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_sizes(mut self, download: Option<u64>, install: Option<u64>) -> Self {
        self.download_size = download;
        self.install_size = install;
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentFilter) -> Self {
        self.environment = environment;
        self
    }

    pub fn as_fragment(mut self, fragment: bool) -> Self {
        self.fragment = fragment;
        self
    }

    /// Mark the plugin as one that must be installed as an unpacked directory.
    pub fn with_unpack(mut self, unpack: bool) -> Self {
        self.unpack = unpack;
        self
    }

    /// Declare the archive a delta over an installed version of the same plugin.
    pub fn with_delta_base(mut self, base: Option<Version>) -> Self {
        self.delta_base = base;
        self
    }

    pub fn identifier(&self) -> &VersionedIdentifier {
        &self.identifier
    }

    pub fn id(&self) -> &str {
        self.identifier.id()
    }

    pub fn version(&self) -> &Version {
        self.identifier.version()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn download_size(&self) -> Option<u64> {
        self.download_size
    }

    pub fn install_size(&self) -> Option<u64> {
        self.install_size
    }

    pub fn environment(&self) -> &EnvironmentFilter {
        &self.environment
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    pub fn is_unpack(&self) -> bool {
        self.unpack
    }

    pub fn delta_base(&self) -> Option<&Version> {
        self.delta_base.as_ref()
    }

    /// Archive identifier of the packed plugin (`plugins/<id>_<version>.jar`).
    pub fn archive_id(&self) -> String {
        format!("plugins/{}.jar", self.identifier.path_name())
    }

    /// Install location relative to a site root.
    ///
    /// Unpacked plugins live in a directory, packed ones in a single archive.
    pub fn install_path(&self) -> String {
        if self.unpack {
            format!("plugins/{}", self.identifier.path_name())
        } else {
            self.archive_id()
        }
    }
}

impl Applicability for PluginEntry {
    fn environment_filter(&self) -> &EnvironmentFilter {
        &self.environment
    }

    fn describe(&self) -> String {
        format!("plugin {}", self.identifier)
    }
}

impl Applicability for &PluginEntry {
    fn environment_filter(&self) -> &EnvironmentFilter {
        &self.environment
    }

    fn describe(&self) -> String {
        (*self).describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_path_depends_on_unpack() {
        let id = VersionedIdentifier::parse("org.example.ui", "1.0.0").unwrap();
        let packed = PluginEntry::new(id.clone());
        let unpacked = PluginEntry::new(id).with_unpack(true);

        assert_eq!(packed.install_path(), "plugins/org.example.ui_1.0.0.jar");
        assert_eq!(unpacked.install_path(), "plugins/org.example.ui_1.0.0");
        assert_eq!(unpacked.archive_id(), "plugins/org.example.ui_1.0.0.jar");
    }
}
