//! Site, feature and plugin model for the update manager.
//!
//! This crate holds the data model and the pure algorithms on it: version
//! and match-rule resolution, environment filtering, patch reconciliation
//! and install ordering. It also owns the TOML manifest boundary and the
//! registry that turns a site URL into a [`Site`].

pub mod content;
pub mod dependency;
pub mod environment;
pub mod error;
pub mod feature;
pub mod manifest;
pub mod patched;
pub mod plugin;
pub mod reference;
pub mod registry;
pub mod site;
pub mod version;

pub use content::{ContentReference, ContentSource};
pub use dependency::DependencyGraph;
pub use environment::{
    Applicability, EnvironmentDimension, EnvironmentFilter, EnvironmentOverrides,
    EnvironmentProvider, Exclusion, FilterReport, PlatformEnvironment, SystemEnvironment,
    filter_applicable,
};
pub use error::{Error, Result};
pub use feature::{DataEntry, Feature, FeatureBuilder, Import, ImportKind, IncludedFeatureReference};
pub use patched::{PatchedFeature, PluginSet, ReconcileWarning};
pub use plugin::PluginEntry;
pub use reference::{FeatureReference, FeatureResolver, ReferenceMetadata};
pub use registry::{FileFeatureResolver, FileSiteFactory, SiteFactory, SiteTypeRegistry};
pub use site::{ArchiveReference, Category, Site, SiteBuilder, SiteKind};
pub use version::{MatchRule, Version, VersionedIdentifier, satisfies};
