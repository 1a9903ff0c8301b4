//! TOML manifests for features (`feature.toml`) and sites (`site.toml`).
//!
//! Manifests are a plain deserialization boundary: the serde structs here
//! mirror the file layout and are converted into the validated model types.
//!
//! ```toml
//! [feature]
//! id = "org.example.tools"
//! version = "1.2.0"
//! os = "linux,win32"
//!
//! [[plugin]]
//! id = "org.example.tools.core"
//! version = "1.2.0"
//! download-size = 1024
//!
//! [[import]]
//! feature = "org.example.base"
//! version = "1.0.0"
//! match = "compatible"
//!
//! [[includes]]
//! id = "org.example.tools.docs"
//! version = "1.2.0"
//! optional = true
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::environment::EnvironmentFilter;
use crate::error::{Error, Result};
use crate::feature::{DataEntry, Feature, Import, ImportKind, IncludedFeatureReference};
use crate::plugin::PluginEntry;
use crate::reference::{FeatureReference, ReferenceMetadata};
use crate::site::{ArchiveReference, Category, SiteBuilder};
use crate::version::{MatchRule, Version, VersionedIdentifier};

/// File name of feature manifests.
pub const FEATURE_MANIFEST: &str = "feature.toml";

/// File name of site catalogs.
pub const SITE_MANIFEST: &str = "site.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureManifest {
    pub feature: FeatureSection,
    #[serde(default, rename = "plugin", skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginSection>,
    #[serde(default, rename = "import", skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<IncludeSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureSection {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_site: Option<String>,
    #[serde(flatten)]
    pub environment: EnvironmentFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginSection {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_size: Option<u64>,
    #[serde(default)]
    pub fragment: bool,
    #[serde(default)]
    pub unpack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_base: Option<String>,
    #[serde(flatten)]
    pub environment: EnvironmentFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImportSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub patch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IncludeSection {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(flatten)]
    pub environment: EnvironmentFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_size: Option<u64>,
}

impl FeatureManifest {
    /// Validate and convert into a frozen [`Feature`].
    pub fn into_feature(self, origin: &str) -> Result<Feature> {
        let section = self.feature;
        let identifier = VersionedIdentifier::parse(section.id, &section.version)?;

        let mut builder = Feature::builder(identifier)
            .primary(section.primary)
            .environment(section.environment);
        if let Some(label) = section.label {
            builder = builder.label(label);
        }
        if let Some(provider) = section.provider {
            builder = builder.provider(provider);
        }
        if let Some(update_site) = section.update_site {
            let url = Url::parse(&update_site).map_err(|source| Error::InvalidUrl {
                url: update_site.clone(),
                source,
            })?;
            builder = builder.update_site(url);
        }

        for plugin in self.plugins {
            let delta_base = plugin.delta_base.as_deref().map(Version::parse).transpose()?;
            let mut entry = PluginEntry::new(VersionedIdentifier::parse(plugin.id, &plugin.version)?)
                .with_sizes(plugin.download_size, plugin.install_size)
                .with_environment(plugin.environment)
                .as_fragment(plugin.fragment)
                .with_unpack(plugin.unpack)
                .with_delta_base(delta_base);
            if let Some(label) = plugin.label {
                entry = entry.with_label(label);
            }
            builder = builder.plugin(entry);
        }

        for import in self.imports {
            builder = builder.import(import.into_import(origin)?);
        }

        for include in self.includes {
            builder = builder.include(
                IncludedFeatureReference::new(VersionedIdentifier::parse(include.id, &include.version)?)
                    .optional(include.optional)
                    .with_environment(include.environment),
            );
        }

        for data in self.data {
            builder = builder.data(DataEntry {
                name: data.name,
                download_size: data.download_size,
            });
        }

        builder.build()
    }
}

impl ImportSection {
    fn into_import(self, origin: &str) -> Result<Import> {
        let (kind, id) = match (self.plugin, self.feature) {
            (Some(id), None) => (ImportKind::Plugin, id),
            (None, Some(id)) => (ImportKind::Feature, id),
            _ => {
                return Err(Error::ManifestParse {
                    path: origin.to_string(),
                    message: "import must name exactly one of 'plugin' or 'feature'".to_string(),
                });
            }
        };

        // Without a version any version will do.
        let (version, rule) = match self.version {
            Some(version) => (version, MatchRule::from_manifest(self.rule.as_deref())),
            None => ("0.0.0".to_string(), MatchRule::None),
        };

        if self.patch && kind == ImportKind::Plugin {
            return Err(Error::ManifestParse {
                path: origin.to_string(),
                message: format!("plugin import '{id}' cannot be a patch"),
            });
        }

        Ok(Import {
            identifier: VersionedIdentifier::parse(id, &version)?,
            rule,
            kind,
            patch: self.patch,
        })
    }
}

impl From<&Feature> for FeatureManifest {
    fn from(feature: &Feature) -> Self {
        Self {
            feature: FeatureSection {
                id: feature.identifier().id().to_string(),
                version: feature.identifier().version().to_string(),
                label: feature.label().map(str::to_string),
                provider: feature.provider().map(str::to_string),
                primary: feature.is_primary(),
                update_site: feature.update_site().map(Url::to_string),
                environment: feature.environment().clone(),
            },
            plugins: feature
                .plugins()
                .iter()
                .map(|entry| PluginSection {
                    id: entry.id().to_string(),
                    version: entry.version().to_string(),
                    label: entry.label().map(str::to_string),
                    download_size: entry.download_size(),
                    install_size: entry.install_size(),
                    fragment: entry.is_fragment(),
                    unpack: entry.is_unpack(),
                    delta_base: entry.delta_base().map(Version::to_string),
                    environment: entry.environment().clone(),
                })
                .collect(),
            imports: feature
                .imports()
                .iter()
                .map(|import| {
                    let id = Some(import.identifier.id().to_string());
                    let any = import.rule == MatchRule::None;
                    ImportSection {
                        plugin: id.clone().filter(|_| import.kind == ImportKind::Plugin),
                        feature: id.filter(|_| import.kind == ImportKind::Feature),
                        version: (!any).then(|| import.identifier.version().to_string()),
                        rule: (!any).then(|| import.rule.manifest_name().to_string()),
                        patch: import.patch,
                    }
                })
                .collect(),
            includes: feature
                .includes()
                .iter()
                .map(|include| IncludeSection {
                    id: include.identifier.id().to_string(),
                    version: include.identifier.version().to_string(),
                    optional: include.optional,
                    environment: include.environment.clone(),
                })
                .collect(),
            data: feature
                .data()
                .iter()
                .map(|data| DataSection {
                    name: data.name.clone(),
                    download_size: data.download_size,
                })
                .collect(),
        }
    }
}

/// Parse a feature manifest. `origin` names the source in errors.
pub fn parse_feature_manifest(content: &str, origin: &str) -> Result<Feature> {
    let manifest: FeatureManifest = toml::from_str(content).map_err(|e| Error::ManifestParse {
        path: origin.to_string(),
        message: e.to_string(),
    })?;
    manifest.into_feature(origin)
}

pub fn render_feature_manifest(feature: &Feature) -> Result<String> {
    toml::to_string_pretty(&FeatureManifest::from(feature))
        .map_err(|e| Error::ManifestSerialize(e.to_string()))
}

pub fn read_feature_manifest(path: &Path) -> Result<Feature> {
    if !path.is_file() {
        return Err(Error::ManifestNotFound(path.to_path_buf()));
    }
    let content = update_fs::io::read_text(&update_fs::NormalizedPath::new(path))?;
    parse_feature_manifest(&content, &path.display().to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteManifest {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default, rename = "feature", skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<SiteFeatureSection>,
    #[serde(default, rename = "archive", skip_serializing_if = "Vec::is_empty")]
    pub archives: Vec<ArchiveSection>,
    #[serde(default, rename = "category", skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<CategorySection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SiteFeatureSection {
    /// Manifest location relative to the site.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    #[serde(flatten)]
    pub environment: EnvironmentFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSection {
    pub path: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SiteManifest {
    /// Add the catalog's features, archives and categories to `builder`.
    pub fn populate(self, mut builder: SiteBuilder) -> Result<SiteBuilder> {
        let site_url = builder.url().clone();
        let resolver = builder.resolver();

        if let Some(label) = self.site.label {
            builder = builder.label(label);
        }

        for category in self.categories {
            builder = builder.category(Category {
                name: category.name,
                label: category.label,
                description: category.description,
            });
        }

        for archive in self.archives {
            let url = join(&site_url, &archive.url)?;
            builder = builder.archive(ArchiveReference {
                id: archive.path,
                url,
                checksum: archive.checksum,
            });
        }

        for feature in self.features {
            let url = join(&site_url, &feature.url)?;
            let identifier = match (feature.id, feature.version) {
                (Some(id), Some(version)) => Some(VersionedIdentifier::parse(id, &version)?),
                (Some(id), None) => Some(VersionedIdentifier::parse(id, "0.0.0")?),
                _ => None,
            };
            let metadata = ReferenceMetadata {
                identifier,
                categories: feature.categories,
                feature_type: feature.feature_type,
                environment: feature.environment,
            };
            builder = builder.feature(FeatureReference::new(
                site_url.clone(),
                url,
                metadata,
                Arc::clone(&resolver),
            ));
        }

        Ok(builder)
    }
}

fn join(base: &Url, relative: &str) -> Result<Url> {
    base.join(relative).map_err(|source| Error::InvalidUrl {
        url: relative.to_string(),
        source,
    })
}

pub fn parse_site_manifest(content: &str, origin: &str) -> Result<SiteManifest> {
    toml::from_str(content).map_err(|e| Error::ManifestParse {
        path: origin.to_string(),
        message: e.to_string(),
    })
}

pub fn render_site_manifest(manifest: &SiteManifest) -> Result<String> {
    toml::to_string_pretty(manifest).map_err(|e| Error::ManifestSerialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOOLS: &str = r#"
[feature]
id = "org.example.tools"
version = "1.2.0"
label = "Example Tools"
primary = true
os = "linux,win32"

[[plugin]]
id = "org.example.tools.core"
version = "1.2.0"
download-size = 1024

[[plugin]]
id = "org.example.tools.gtk"
version = "1.2.0"
ws = "gtk"
unpack = true

[[import]]
feature = "org.example.base"
version = "1.0.0"

[[import]]
plugin = "org.example.runtime"

[[includes]]
id = "org.example.tools.docs"
version = "1.2.0"
optional = true
"#;

    #[test]
    fn parses_feature_manifest() {
        let feature = parse_feature_manifest(TOOLS, "tools").unwrap();

        assert_eq!(feature.identifier().to_string(), "org.example.tools_1.2.0");
        assert!(feature.is_primary());
        assert_eq!(feature.environment().os.as_deref(), Some("linux,win32"));
        assert_eq!(feature.plugins().len(), 2);
        assert!(feature.plugins()[1].is_unpack());
        assert_eq!(feature.plugins()[0].download_size(), Some(1024));

        let base = &feature.imports()[0];
        assert_eq!(base.kind, ImportKind::Feature);
        assert_eq!(base.rule, MatchRule::Compatible);

        let runtime = &feature.imports()[1];
        assert_eq!(runtime.kind, ImportKind::Plugin);
        assert_eq!(runtime.rule, MatchRule::None);

        assert!(feature.includes()[0].optional);
    }

    #[test]
    fn rendered_manifest_parses_back_to_same_feature() {
        let feature = parse_feature_manifest(TOOLS, "tools").unwrap();
        let rendered = render_feature_manifest(&feature).unwrap();
        let reparsed = parse_feature_manifest(&rendered, "rendered").unwrap();
        assert_eq!(reparsed, feature);
    }

    #[test]
    fn bad_version_is_a_parse_error() {
        let text = "[feature]\nid = \"a\"\nversion = \"1.x\"\n";
        assert!(matches!(
            parse_feature_manifest(text, "a"),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn import_needs_exactly_one_target() {
        let text = "[feature]\nid = \"a\"\nversion = \"1\"\n[[import]]\nversion = \"1\"\n";
        assert!(matches!(
            parse_feature_manifest(text, "a"),
            Err(Error::ManifestParse { .. })
        ));
    }

    #[test]
    fn none_rule_in_manifest_pins_version() {
        let text = "[feature]\nid = \"a\"\nversion = \"1\"\n[[import]]\nfeature = \"b\"\nversion = \"2.0\"\nmatch = \"none\"\n";
        let feature = parse_feature_manifest(text, "a").unwrap();
        assert_eq!(feature.imports()[0].rule, MatchRule::Perfect);
    }

    #[test]
    fn malformed_toml_names_origin() {
        let err = parse_feature_manifest("[feature", "broken.toml").unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn missing_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FEATURE_MANIFEST);
        assert!(matches!(
            read_feature_manifest(&path),
            Err(Error::ManifestNotFound(_))
        ));
    }

    #[test]
    fn site_manifest_round_trip() {
        let text = r#"
[site]
label = "Releases"

[[feature]]
url = "features/a_1.0.0/feature.toml"
id = "a"
version = "1.0.0"
categories = ["tools"]
os = "linux"

[[archive]]
path = "plugins/p_1.0.0.jar"
url = "https://mirror.example.org/p.jar"
checksum = "sha256:00"

[[category]]
name = "tools"
label = "Tools"
"#;
        let manifest = parse_site_manifest(text, "site.toml").unwrap();
        assert_eq!(manifest.features[0].environment.os.as_deref(), Some("linux"));
        let rendered = render_site_manifest(&manifest).unwrap();
        assert_eq!(parse_site_manifest(&rendered, "rendered").unwrap(), manifest);
    }
}
