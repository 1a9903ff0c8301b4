//! Install and remove batches.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use update_model::site::directory_url;
use update_model::{
    ContentReference, DependencyGraph, Feature, FeatureReference, PlatformEnvironment, Site,
    VersionedIdentifier, filter_applicable,
};

use super::{BatchReport, InstallOptions, UnitStatus, UpdateEngine};
use crate::configuration::{ActivityAction, ConfigurationActivity};
use crate::download::transfer;
use crate::transaction::{ConsumerReport, ContentConsumer};
use crate::{Error, Result};

/// Scratch directory for remote archives, below the state directory.
pub const DOWNLOAD_DIR: &str = "downloads";

impl UpdateEngine {
    /// Install `reference` and its included features into the install
    /// site `site_url`, then configure what was installed.
    ///
    /// Units go dependency-first, one transaction each. The first failing
    /// unit is aborted and the rest are skipped; units installed before it
    /// stay installed and are configured. The configuration change and an
    /// install activity are recorded even for a partial batch.
    pub fn install_feature(
        &self,
        reference: &FeatureReference,
        site_url: &Url,
        options: &InstallOptions,
    ) -> Result<BatchReport> {
        let (target_url, binding) = self.configured_site(site_url)?;
        if !binding.is_install_site() {
            return Err(Error::NotInstallable {
                site: target_url.to_string(),
            });
        }
        let source = self.resolve(reference.site_url())?;
        let root = reference.feature()?;
        let root_id = root.identifier().clone();
        let env = self.ctx.environment().clone();
        let mut batch = BatchReport::default();

        let (applicable, filtered) = filter_applicable(std::iter::once(Arc::clone(&root)), &env);
        batch.filtered.merge(filtered);
        if applicable.is_empty() {
            batch.record(
                root_id,
                UnitStatus::Skipped {
                    reason: "does not apply to this platform".to_string(),
                },
                None,
            );
            return Ok(batch);
        }

        let tree = self.collect_tree(&source, Arc::clone(&root), options, &env, &mut batch)?;
        let order = install_order(&tree)?;
        tracing::info!(
            feature = %root_id,
            site = %target_url,
            units = order.len(),
            "Installing feature tree"
        );

        let target = self.resolve(&target_url)?;
        let mut placed = Vec::new();
        let mut failed = false;
        let mut fatal = None;
        for id in order {
            let Some(feature) = tree.get(&id) else { continue };
            if failed {
                batch.record(
                    id,
                    UnitStatus::Skipped {
                        reason: "an earlier unit failed".to_string(),
                    },
                    None,
                );
                continue;
            }
            if target.find_feature(&id).is_some() {
                batch.record(id.clone(), UnitStatus::AlreadyInstalled, None);
                placed.push(id);
                continue;
            }

            match self.install_unit(&source, Arc::clone(feature), &target_url, options, &env, &mut batch) {
                Ok(report) => {
                    batch.record(id.clone(), UnitStatus::Installed, Some(report));
                    placed.push(id);
                }
                Err(e) => {
                    failed = true;
                    batch.record(id, UnitStatus::Failed { message: e.to_string() }, None);
                    if matches!(e, Error::RecoveryLog { .. }) {
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            // The log is left for the next recovery pass.
            return Err(e);
        }

        if !placed.is_empty() {
            let mut activity = ConfigurationActivity::new(ActivityAction::FeatureInstall, root_id.to_string());
            if !batch.is_success() {
                activity = activity.failed();
            }
            self.commit(format!("install {root_id}"), activity, |config| {
                let binding = config
                    .site_mut(&target_url)
                    .ok_or_else(|| Error::UnknownSite(target_url.to_string()))?;
                for id in &placed {
                    binding.configure(id.clone());
                }
                Ok(())
            })?;
        }

        self.ctx.finish_operation(!batch.recovery_inconsistent)?;
        tracing::info!(
            feature = %root_id,
            installed = placed.len(),
            success = batch.is_success(),
            "Install batch finished"
        );
        Ok(batch)
    }

    /// The root plus every applicable, selected included feature, and the
    /// root's patches on the source site when asked for.
    fn collect_tree(
        &self,
        source: &Site,
        root: Arc<Feature>,
        options: &InstallOptions,
        env: &PlatformEnvironment,
        batch: &mut BatchReport,
    ) -> Result<BTreeMap<VersionedIdentifier, Arc<Feature>>> {
        let root_id = root.identifier().clone();
        let mut tree = BTreeMap::new();
        let mut not_selected = BTreeSet::new();
        let mut pending = vec![Arc::clone(&root)];
        tree.insert(root_id.clone(), root);

        while let Some(feature) = pending.pop() {
            let (includes, filtered) = filter_applicable(feature.includes().iter(), env);
            batch.filtered.merge(filtered);
            for include in includes {
                let id = &include.identifier;
                if tree.contains_key(id) {
                    continue;
                }
                if include.optional && !options.optional.contains(id) {
                    if not_selected.insert(id.clone()) {
                        batch.record(id.clone(), UnitStatus::NotSelected, None);
                    }
                    continue;
                }
                let child = source
                    .find_feature(id)
                    .ok_or_else(|| Error::UnknownFeature(format!("{id} (included by {})", feature.identifier())))?
                    .feature()?;
                tree.insert(id.clone(), Arc::clone(&child));
                pending.push(child);
            }
        }

        if options.include_patches {
            for candidate in source.feature_references() {
                let patch = match candidate.feature() {
                    Ok(patch) => patch,
                    Err(e) => {
                        tracing::warn!(reference = %candidate, error = %e, "Skipping unresolvable patch candidate");
                        continue;
                    }
                };
                if !patch.is_patch_of(&root_id) || tree.contains_key(patch.identifier()) {
                    continue;
                }
                let (kept, filtered) = filter_applicable(std::iter::once(patch), env);
                batch.filtered.merge(filtered);
                for patch in kept {
                    tracing::debug!(base = %root_id, patch = %patch.identifier(), "Adding patch to install");
                    tree.insert(patch.identifier().clone(), patch);
                }
            }
        }
        Ok(tree)
    }

    /// One transaction: download, stage, close.
    fn install_unit(
        &self,
        source: &Site,
        feature: Arc<Feature>,
        target_url: &Url,
        options: &InstallOptions,
        env: &PlatformEnvironment,
        batch: &mut BatchReport,
    ) -> Result<ConsumerReport> {
        let mut tx = self.begin_install(Arc::clone(&feature), target_url)?;
        if let Some(cancel) = &options.cancel {
            tx = tx.with_cancellation(cancel.clone());
        }
        if let Some(monitor) = &options.monitor {
            tx = tx.with_monitor(Arc::clone(monitor));
        }

        let (plugins, filtered) = filter_applicable(feature.plugins().iter().cloned(), env);
        batch.filtered.merge(filtered);
        let (present, needed): (Vec<_>, Vec<_>) = plugins
            .into_iter()
            .partition(|entry| tx.site().has_plugin(entry.identifier()));
        for entry in &present {
            tracing::debug!(plugin = %entry.identifier(), "Plugin already on target site");
        }

        let result = (|| -> Result<ConsumerReport> {
            let mut references = Vec::with_capacity(needed.len() + feature.data().len());
            for entry in &needed {
                references.push(source.plugin_content(entry)?);
            }
            for data in feature.data() {
                references.push(source.data_content(&feature, data)?);
            }

            let (local, downloaded) = self.download_remote(references, options)?;
            let stored = (|| -> Result<ConsumerReport> {
                let (plugin_refs, data_refs) = local.split_at(needed.len());
                for (entry, reference) in needed.iter().zip(plugin_refs) {
                    tx.store_plugin(entry, reference)?;
                }
                for reference in data_refs {
                    tx.store(reference)?;
                }
                tx.close()
            })();
            for path in &downloaded {
                if let Err(e) = update_fs::io::remove_path(path) {
                    tracing::warn!(path = %path.display(), error = %e, "Could not remove downloaded archive");
                }
            }
            stored
        })();

        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                let aborted = tx.abort();
                batch.recovery_inconsistent |= aborted.recovery_inconsistent;
                for warning in aborted.warnings {
                    batch.warn(warning);
                }
                Err(e)
            }
        }
    }

    /// Fetch remote references into the download directory concurrently.
    ///
    /// Returns the references rewritten to their local copies and the
    /// paths to delete afterwards. Local references are passed through.
    fn download_remote(
        &self,
        references: Vec<ContentReference>,
        options: &InstallOptions,
    ) -> Result<(Vec<ContentReference>, Vec<PathBuf>)> {
        if !references.iter().any(ContentReference::is_remote) {
            return Ok((references, Vec::new()));
        }

        let dir = self.ctx.state_dir().join(DOWNLOAD_DIR).to_native();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let cancel = options.cancel.clone().unwrap_or_default();
        let mut group = self
            .ctx
            .downloads()
            .group_with_cancellation::<(usize, PathBuf)>("feature archives", cancel);
        for (idx, reference) in references.iter().enumerate() {
            if !reference.is_remote() {
                continue;
            }
            let dest = dir.join(local_random_identifier(reference.identifier()));
            let fetcher = self.ctx.shared_fetcher();
            let chunk = self.ctx.settings().download_chunk_size;
            let monitor = options.monitor.clone();
            let reference = reference.clone();
            group.spawn(reference.identifier().to_string(), move |cancel| {
                transfer(fetcher.as_ref(), &reference, &dest, chunk, cancel, monitor.as_deref())?;
                Ok((idx, dest))
            });
        }

        let mut local = references;
        let mut downloaded = Vec::new();
        let mut first_error = None;
        for (label, result) in group.wait_for_all() {
            match result {
                Ok((idx, path)) => {
                    local[idx] = local[idx].relocated(&path);
                    downloaded.push(path);
                }
                Err(e) => {
                    tracing::warn!(archive = %label, error = %e, "Download failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for path in &downloaded {
                if let Err(cleanup) = update_fs::io::remove_path(path) {
                    tracing::warn!(path = %path.display(), error = %cleanup, "Could not remove downloaded archive");
                }
            }
            return Err(e);
        }
        Ok((local, downloaded))
    }

    /// Remove an unconfigured feature from `site_url` and forget it in the
    /// site's policy.
    pub fn remove_feature(&self, reference: &FeatureReference, site_url: &Url) -> Result<BatchReport> {
        let key = directory_url(site_url.clone());
        let feature = reference.feature()?;
        let id = feature.identifier().clone();
        let mut batch = BatchReport::default();

        {
            let mut tx = self.begin_remove(Arc::clone(&feature), &key)?;
            match tx.close() {
                Ok(report) => batch.record(id.clone(), UnitStatus::Removed, Some(report)),
                Err(e) => {
                    let aborted = tx.abort();
                    batch.recovery_inconsistent |= aborted.recovery_inconsistent;
                    for warning in aborted.warnings {
                        batch.warn(warning);
                    }
                    let fatal = matches!(e, Error::RecoveryLog { .. });
                    batch.record(id.clone(), UnitStatus::Failed { message: e.to_string() }, None);
                    if fatal {
                        return Err(e);
                    }
                }
            }
        }

        let mut activity = ConfigurationActivity::new(ActivityAction::FeatureRemove, id.to_string());
        if !batch.is_success() {
            activity = activity.failed();
        }
        self.commit(format!("remove {id}"), activity, |config| {
            if let Some(binding) = config.site_mut(&key) {
                binding.policy_mut().forget(&id);
            }
            Ok(())
        })?;

        self.ctx.finish_operation(!batch.recovery_inconsistent)?;
        Ok(batch)
    }
}

/// Dependency-first order of the features in `tree`.
fn install_order(tree: &BTreeMap<VersionedIdentifier, Arc<Feature>>) -> Result<Vec<VersionedIdentifier>> {
    let mut graph = DependencyGraph::new();
    for feature in tree.values() {
        graph.add_feature(feature);
    }
    let order = graph.topological_sort()?;
    Ok(order.into_iter().filter(|id| tree.contains_key(id)).collect())
}

/// `<stem>_<millis>_<random><.ext>` for a staged download of `identifier`.
fn local_random_identifier(identifier: &str) -> String {
    let name = identifier.rsplit('/').next().unwrap_or(identifier);
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{stem}_{millis}_{}{ext}", &random[..8])
}
