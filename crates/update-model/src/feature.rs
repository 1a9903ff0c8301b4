//! Features: versioned bundles of plugins, imports and included features.
//!
//! A [`Feature`] is immutable. Manifests are parsed into a
//! [`FeatureBuilder`], which validates and freezes the result in
//! [`FeatureBuilder::build`].

use url::Url;

use crate::environment::{Applicability, EnvironmentFilter};
use crate::error::{Error, Result};
use crate::plugin::PluginEntry;
use crate::version::{MatchRule, VersionedIdentifier, satisfies};

/// What an import points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportKind {
    Plugin,
    Feature,
}

/// A requirement on another plugin or feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub identifier: VersionedIdentifier,
    pub rule: MatchRule,
    pub kind: ImportKind,
    /// A feature import marked as a patch makes the importing feature a
    /// patch of the imported one.
    pub patch: bool,
}

impl Import {
    pub fn plugin(identifier: VersionedIdentifier, rule: MatchRule) -> Self {
        Self {
            identifier,
            rule,
            kind: ImportKind::Plugin,
            patch: false,
        }
    }

    pub fn feature(identifier: VersionedIdentifier, rule: MatchRule) -> Self {
        Self {
            identifier,
            rule,
            kind: ImportKind::Feature,
            patch: false,
        }
    }

    /// A patch import on `base`. Patches pin their base exactly.
    pub fn patch_of(base: VersionedIdentifier) -> Self {
        Self {
            identifier: base,
            rule: MatchRule::Perfect,
            kind: ImportKind::Feature,
            patch: true,
        }
    }

    pub fn is_satisfied_by(&self, candidate: &VersionedIdentifier) -> bool {
        satisfies(candidate, &self.identifier, self.rule)
    }
}

/// A nested feature included by a parent feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedFeatureReference {
    pub identifier: VersionedIdentifier,
    pub optional: bool,
    pub environment: EnvironmentFilter,
}

impl IncludedFeatureReference {
    pub fn new(identifier: VersionedIdentifier) -> Self {
        Self {
            identifier,
            optional: false,
            environment: EnvironmentFilter::default(),
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentFilter) -> Self {
        self.environment = environment;
        self
    }
}

impl Applicability for IncludedFeatureReference {
    fn environment_filter(&self) -> &EnvironmentFilter {
        &self.environment
    }

    fn describe(&self) -> String {
        format!("included feature {}", self.identifier)
    }
}

impl Applicability for &IncludedFeatureReference {
    fn environment_filter(&self) -> &EnvironmentFilter {
        &self.environment
    }

    fn describe(&self) -> String {
        (*self).describe()
    }
}

/// A non-plugin file shipped with a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub name: String,
    pub download_size: Option<u64>,
}

/// A frozen feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    identifier: VersionedIdentifier,
    label: Option<String>,
    provider: Option<String>,
    primary: bool,
    update_site: Option<Url>,
    environment: EnvironmentFilter,
    plugins: Vec<PluginEntry>,
    imports: Vec<Import>,
    includes: Vec<IncludedFeatureReference>,
    data: Vec<DataEntry>,
}

impl Feature {
    pub fn builder(identifier: VersionedIdentifier) -> FeatureBuilder {
        FeatureBuilder::new(identifier)
    }

    pub fn identifier(&self) -> &VersionedIdentifier {
        &self.identifier
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn update_site(&self) -> Option<&Url> {
        self.update_site.as_ref()
    }

    pub fn environment(&self) -> &EnvironmentFilter {
        &self.environment
    }

    pub fn plugins(&self) -> &[PluginEntry] {
        &self.plugins
    }

    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    pub fn includes(&self) -> &[IncludedFeatureReference] {
        &self.includes
    }

    pub fn data(&self) -> &[DataEntry] {
        &self.data
    }

    /// Whether any feature import is flagged as a patch.
    pub fn is_patch(&self) -> bool {
        self.imports.iter().any(|import| import.patch)
    }

    /// Whether this feature declares itself a patch of `base`.
    pub fn is_patch_of(&self, base: &VersionedIdentifier) -> bool {
        self.imports
            .iter()
            .any(|import| import.patch && import.is_satisfied_by(base))
    }

    /// Reopen as a builder, for deriving a modified copy.
    pub fn to_builder(&self) -> FeatureBuilder {
        FeatureBuilder {
            feature: self.clone(),
        }
    }

    /// Install location of the feature manifest relative to a site root.
    pub fn install_dir(&self) -> String {
        format!("features/{}", self.identifier.path_name())
    }
}

impl Applicability for Feature {
    fn environment_filter(&self) -> &EnvironmentFilter {
        &self.environment
    }

    fn describe(&self) -> String {
        format!("feature {}", self.identifier)
    }
}

/// Mutable stage of a [`Feature`].
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    feature: Feature,
}

impl FeatureBuilder {
    pub fn new(identifier: VersionedIdentifier) -> Self {
        Self {
            feature: Feature {
                identifier,
                label: None,
                provider: None,
                primary: false,
                update_site: None,
                environment: EnvironmentFilter::default(),
                plugins: Vec::new(),
                imports: Vec::new(),
                includes: Vec::new(),
                data: Vec::new(),
            },
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.feature.label = Some(label.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.feature.provider = Some(provider.into());
        self
    }

    pub fn primary(mut self, primary: bool) -> Self {
        self.feature.primary = primary;
        self
    }

    pub fn update_site(mut self, url: Url) -> Self {
        self.feature.update_site = Some(url);
        self
    }

    pub fn environment(mut self, environment: EnvironmentFilter) -> Self {
        self.feature.environment = environment;
        self
    }

    pub fn plugin(mut self, entry: PluginEntry) -> Self {
        self.feature.plugins.push(entry);
        self
    }

    pub fn import(mut self, import: Import) -> Self {
        self.feature.imports.push(import);
        self
    }

    pub fn include(mut self, include: IncludedFeatureReference) -> Self {
        self.feature.includes.push(include);
        self
    }

    pub fn data(mut self, entry: DataEntry) -> Self {
        self.feature.data.push(entry);
        self
    }

    /// Validate and freeze.
    ///
    /// Identifiers must be usable as path components and a feature may not
    /// declare the same plugin twice or include itself.
    pub fn build(self) -> Result<Feature> {
        let feature = self.feature;
        update_fs::validate_path_component(feature.identifier.id(), "Feature id")?;

        let mut seen = std::collections::HashSet::new();
        for plugin in &feature.plugins {
            update_fs::validate_path_component(plugin.id(), "Plugin id")?;
            if !seen.insert(plugin.identifier().clone()) {
                return Err(Error::InvalidIdentifier {
                    id: plugin.identifier().to_string(),
                    reason: format!("declared twice by feature {}", feature.identifier),
                });
            }
        }

        for include in &feature.includes {
            if include.identifier == feature.identifier {
                return Err(Error::InvalidIdentifier {
                    id: include.identifier.to_string(),
                    reason: "feature includes itself".to_string(),
                });
            }
        }

        for data in &feature.data {
            update_fs::validate_path_component(&data.name, "Data entry")?;
        }

        Ok(feature)
    }
}
