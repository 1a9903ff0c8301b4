//! A base feature grouped with the patches that apply on top of it.
//!
//! [`PatchedFeature::plugins`] is the reconciliation primitive: it walks the
//! base and then each patch in insertion order and keeps one entry per
//! plugin id. A later entry replaces an earlier one only when its version is
//! strictly greater, so on equal versions the first one seen (the base)
//! wins. Features that fail to resolve are skipped and reported.

use std::collections::HashMap;
use std::fmt;

use crate::plugin::PluginEntry;
use crate::reference::FeatureReference;

/// A feature reference that could not take part in reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileWarning {
    pub reference: String,
    pub message: String,
}

impl fmt::Display for ReconcileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reference, self.message)
    }
}

/// Reconciled plugin set.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    /// One entry per plugin id, in first-seen order.
    pub entries: Vec<PluginEntry>,
    pub warnings: Vec<ReconcileWarning>,
}

impl PluginSet {
    pub fn get(&self, plugin_id: &str) -> Option<&PluginEntry> {
        self.entries.iter().find(|entry| entry.id() == plugin_id)
    }
}

#[derive(Debug, Clone)]
pub struct PatchedFeature {
    base: FeatureReference,
    patches: Vec<FeatureReference>,
}

impl PatchedFeature {
    pub fn new(base: FeatureReference) -> Self {
        Self {
            base,
            patches: Vec::new(),
        }
    }

    /// Add a patch. Returns `false` if it is the base or already present.
    pub fn add_patch(&mut self, patch: FeatureReference) -> bool {
        if patch == self.base || self.patches.contains(&patch) {
            return false;
        }
        self.patches.push(patch);
        true
    }

    pub fn base(&self) -> &FeatureReference {
        &self.base
    }

    pub fn patches(&self) -> &[FeatureReference] {
        &self.patches
    }

    /// Base followed by patches.
    pub fn references(&self) -> impl Iterator<Item = &FeatureReference> {
        std::iter::once(&self.base).chain(self.patches.iter())
    }

    /// Plugins that would actually be installed for this group.
    pub fn plugins(&self) -> PluginSet {
        let mut set = PluginSet::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for reference in self.references() {
            let feature = match reference.feature() {
                Ok(feature) => feature,
                Err(e) => {
                    tracing::warn!(feature = %reference, error = %e, "Skipping unresolvable feature during patch reconciliation");
                    set.warnings.push(ReconcileWarning {
                        reference: reference.to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            for entry in feature.plugins() {
                match index.get(entry.id()) {
                    None => {
                        index.insert(entry.id().to_string(), set.entries.len());
                        set.entries.push(entry.clone());
                    }
                    Some(&slot) => {
                        if entry.version() > set.entries[slot].version() {
                            tracing::debug!(
                                plugin = entry.id(),
                                from = %set.entries[slot].version(),
                                to = %entry.version(),
                                patch = %reference,
                                "Patch overrides plugin version"
                            );
                            set.entries[slot] = entry.clone();
                        }
                    }
                }
            }
        }

        set
    }
}
