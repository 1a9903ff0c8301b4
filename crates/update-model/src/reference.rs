//! Lazy, memoized handles to features on a site.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use url::Url;

use crate::environment::{Applicability, EnvironmentFilter};
use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::version::VersionedIdentifier;

/// Turns a feature manifest location into a [`Feature`].
///
/// Each site kind supplies its own resolver; file sites read the manifest
/// from disk, remote sites fetch it.
pub trait FeatureResolver: Send + Sync {
    fn resolve(&self, manifest_url: &Url) -> Result<Feature>;
}

struct Unresolvable;

impl FeatureResolver for Unresolvable {
    fn resolve(&self, manifest_url: &Url) -> Result<Feature> {
        Err(Error::UnknownFeature(manifest_url.to_string()))
    }
}

/// What a site manifest says about a feature before it is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMetadata {
    pub identifier: Option<VersionedIdentifier>,
    pub categories: Vec<String>,
    pub feature_type: Option<String>,
    pub environment: EnvironmentFilter,
}

struct Inner {
    site_url: Url,
    url: Url,
    metadata: ReferenceMetadata,
    resolver: Arc<dyn FeatureResolver>,
    resolved: OnceLock<Arc<Feature>>,
}

/// A feature listed by a site.
///
/// Cloning is cheap and clones share the memoized feature. The owning site
/// is referenced by URL only. Equality and hashing use the manifest URL.
#[derive(Clone)]
pub struct FeatureReference {
    inner: Arc<Inner>,
}

impl FeatureReference {
    pub fn new(
        site_url: Url,
        url: Url,
        metadata: ReferenceMetadata,
        resolver: Arc<dyn FeatureResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                site_url,
                url,
                metadata,
                resolver,
                resolved: OnceLock::new(),
            }),
        }
    }

    /// A reference whose feature is already known.
    pub fn resolved(site_url: Url, url: Url, feature: Feature) -> Self {
        let metadata = ReferenceMetadata {
            identifier: Some(feature.identifier().clone()),
            environment: feature.environment().clone(),
            ..ReferenceMetadata::default()
        };
        let reference = Self::new(site_url, url, metadata, Arc::new(Unresolvable));
        let _ = reference.inner.resolved.set(Arc::new(feature));
        reference
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn site_url(&self) -> &Url {
        &self.inner.site_url
    }

    pub fn categories(&self) -> &[String] {
        &self.inner.metadata.categories
    }

    pub fn feature_type(&self) -> Option<&str> {
        self.inner.metadata.feature_type.as_deref()
    }

    pub fn metadata(&self) -> &ReferenceMetadata {
        &self.inner.metadata
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.get().is_some()
    }

    /// Resolve the feature, parsing it on first use.
    ///
    /// Failures are not cached; a later call retries.
    pub fn feature(&self) -> Result<Arc<Feature>> {
        if let Some(feature) = self.inner.resolved.get() {
            return Ok(Arc::clone(feature));
        }

        tracing::debug!(url = %self.inner.url, "Resolving feature reference");
        let feature = Arc::new(self.inner.resolver.resolve(&self.inner.url)?);
        if let Some(declared) = &self.inner.metadata.identifier
            && declared != feature.identifier()
        {
            tracing::warn!(
                url = %self.inner.url,
                declared = %declared,
                actual = %feature.identifier(),
                "Site manifest and feature manifest disagree on identifier"
            );
        }
        Ok(Arc::clone(self.inner.resolved.get_or_init(|| feature)))
    }

    /// Supply the feature without resolving it.
    ///
    /// A reference that already holds a feature is read-only.
    pub fn preload(&self, feature: Feature) -> Result<()> {
        let identifier = feature.identifier().to_string();
        self.inner
            .resolved
            .set(Arc::new(feature))
            .map_err(|_| Error::ReadOnlyFeature(identifier))
    }

    /// Declared identifier, or the resolved feature's identifier.
    pub fn identifier(&self) -> Result<VersionedIdentifier> {
        match &self.inner.metadata.identifier {
            Some(identifier) => Ok(identifier.clone()),
            None => Ok(self.feature()?.identifier().clone()),
        }
    }
}

impl PartialEq for FeatureReference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.url == other.inner.url
    }
}

impl Eq for FeatureReference {}

impl Hash for FeatureReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.url.hash(state);
    }
}

impl fmt::Debug for FeatureReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureReference")
            .field("url", &self.inner.url.as_str())
            .field("identifier", &self.inner.metadata.identifier)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl fmt::Display for FeatureReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.metadata.identifier {
            Some(identifier) => write!(f, "{identifier}"),
            None => write!(f, "{}", self.inner.url),
        }
    }
}

impl Applicability for FeatureReference {
    fn environment_filter(&self) -> &EnvironmentFilter {
        &self.inner.metadata.environment
    }

    fn describe(&self) -> String {
        format!("feature {self}")
    }
}
