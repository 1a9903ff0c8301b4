//! Which features of a configured site are active.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use update_model::{FeatureReference, VersionedIdentifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Only explicitly configured features are active.
    #[default]
    UserInclude,
    /// Every feature is active unless explicitly unconfigured.
    UserExclude,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserInclude => "user-include",
            Self::UserExclude => "user-exclude",
        })
    }
}

/// Include/exclude lists keyed by feature identity.
///
/// Both lists are kept under either kind: the inactive list remembers what
/// the user turned off, which revert uses to tell "never seen" from
/// "explicitly unconfigured".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationPolicy {
    kind: PolicyKind,
    configured: BTreeSet<VersionedIdentifier>,
    unconfigured: BTreeSet<VersionedIdentifier>,
}

impl ConfigurationPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn is_configured(&self, feature: &VersionedIdentifier) -> bool {
        match self.kind {
            PolicyKind::UserInclude => self.configured.contains(feature),
            PolicyKind::UserExclude => !self.unconfigured.contains(feature),
        }
    }

    /// Mark `feature` active. Returns `false` if it already was.
    pub fn configure(&mut self, feature: VersionedIdentifier) -> bool {
        let was = self.is_configured(&feature);
        self.unconfigured.remove(&feature);
        self.configured.insert(feature);
        !was
    }

    /// Mark `feature` inactive. Returns `false` if it already was.
    pub fn unconfigure(&mut self, feature: VersionedIdentifier) -> bool {
        let was = self.is_configured(&feature);
        self.configured.remove(&feature);
        self.unconfigured.insert(feature);
        was
    }

    /// Drop every trace of `feature`, e.g. after it was removed from disk.
    pub fn forget(&mut self, feature: &VersionedIdentifier) {
        self.configured.remove(feature);
        self.unconfigured.remove(feature);
    }

    pub fn configured(&self) -> &BTreeSet<VersionedIdentifier> {
        &self.configured
    }

    pub fn unconfigured(&self) -> &BTreeSet<VersionedIdentifier> {
        &self.unconfigured
    }

    /// Every identity this policy has an opinion about.
    pub fn known(&self) -> BTreeSet<VersionedIdentifier> {
        self.configured.union(&self.unconfigured).cloned().collect()
    }

    /// The active subset of `references`. Unresolvable references are skipped.
    pub fn filter_configured(&self, references: &[FeatureReference]) -> Vec<FeatureReference> {
        references
            .iter()
            .filter(|reference| match reference.identifier() {
                Ok(id) => self.is_configured(&id),
                Err(e) => {
                    tracing::warn!(reference = %reference, error = %e, "Skipping unresolvable feature reference");
                    false
                }
            })
            .cloned()
            .collect()
    }
}
