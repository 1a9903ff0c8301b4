//! Staging content into a storable site.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use update_fs::NormalizedPath;
use update_model::{ContentReference, Site};

use super::{ConsumerReport, ContentConsumer, TransactionState};
use crate::download::{CancellationToken, DownloadMonitor, transfer};
use crate::recovery::{LogEntryKind, LogTransaction, TEMP_SUFFIX};
use crate::{Error, Result, UpdateContext};

#[derive(Debug, Clone)]
struct Staged {
    temp: NormalizedPath,
    final_path: NormalizedPath,
}

/// Stages content below a site root and commits it by renaming.
///
/// Every action is journaled under the consumer's own [`LogTransaction`],
/// which stays open until the consumer is dropped.
///
/// Relative paths come from content identifiers (`plugins/a_1.0.0.jar`,
/// `features/f_1.0.0/feature.toml`) and must stay inside the root.
pub struct SiteContentConsumer<'a> {
    ctx: &'a UpdateContext,
    journal: LogTransaction<'a>,
    root: NormalizedPath,
    staged: Vec<Staged>,
    scratch: Vec<NormalizedPath>,
    renamed: Vec<NormalizedPath>,
    state: TransactionState,
    cancel: CancellationToken,
    monitor: Option<Arc<DownloadMonitor>>,
}

impl std::fmt::Debug for SiteContentConsumer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteContentConsumer")
            .field("root", &self.root)
            .field("transaction", &self.journal.id())
            .field("state", &self.state)
            .field("staged", &self.staged.len())
            .finish()
    }
}

impl<'a> SiteContentConsumer<'a> {
    pub fn new(ctx: &'a UpdateContext, site: &Site) -> Result<Self> {
        let root = site.store_root().map_err(|_| Error::NotInstallable {
            site: site.url().to_string(),
        })?;
        Ok(Self {
            ctx,
            journal: ctx.log().begin_transaction(),
            root: NormalizedPath::new(root),
            staged: Vec::new(),
            scratch: Vec::new(),
            renamed: Vec::new(),
            state: TransactionState::Open,
            cancel: CancellationToken::new(),
            monitor: None,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.set_cancellation(cancel);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<DownloadMonitor>) -> Self {
        self.set_monitor(monitor);
        self
    }

    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub fn set_monitor(&mut self, monitor: Arc<DownloadMonitor>) {
        self.monitor = Some(monitor);
    }

    pub fn root(&self) -> &NormalizedPath {
        &self.root
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The recovery log transaction this consumer writes under.
    pub fn journal(&self) -> &LogTransaction<'a> {
        &self.journal
    }

    /// Final location of `relative` below the root.
    pub fn final_path(&self, relative: &str) -> Result<NormalizedPath> {
        for segment in relative.split('/') {
            update_fs::validate_path_component(segment, "Content path segment")?;
        }
        Ok(self.root.join(relative))
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.state.accepts_content() {
            Ok(())
        } else {
            Err(Error::ConsumerClosed {
                state: self.state.to_string(),
            })
        }
    }

    /// Stage `relative` by letting `write` fill the temp path.
    ///
    /// The temp path is logged and tracked before `write` runs, so a failed
    /// or interrupted write is still cleaned up by [`abort`](ContentConsumer::abort).
    pub fn stage_with<F>(&mut self, relative: &str, write: F) -> Result<NormalizedPath>
    where
        F: FnOnce(&Self, &Path) -> Result<()>,
    {
        self.ensure_accepting()?;
        self.cancel.check()?;

        let final_path = self.final_path(relative)?;
        if final_path.exists() || self.staged.iter().any(|s| s.final_path == final_path) {
            return Err(Error::AlreadyExists {
                path: final_path.to_native(),
            });
        }

        let temp = final_path.with_suffix(TEMP_SUFFIX);
        if temp.exists() {
            tracing::debug!(path = %temp, "Removing stale temp file");
            self.journal.append(LogEntryKind::Delete, &temp)?;
            update_fs::io::remove_path(&temp.to_native())?;
        }
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent.to_native()).map_err(|e| Error::io(parent.to_native(), e))?;
        }

        self.journal.append(LogEntryKind::BundleJarEntry, &temp)?;
        self.staged.push(Staged {
            temp: temp.clone(),
            final_path,
        });
        self.state = TransactionState::Storing;

        write(&*self, &temp.to_native())?;
        tracing::debug!(path = %temp, "Staged content");
        Ok(temp)
    }

    pub fn stage_bytes(&mut self, relative: &str, bytes: &[u8]) -> Result<NormalizedPath> {
        self.stage_with(relative, |_, temp| {
            fs::write(temp, bytes).map_err(|e| Error::io(temp, e))
        })
    }

    /// Copy `reference` to `dest` with this consumer's cancellation and monitor.
    pub fn transfer_to(&self, reference: &ContentReference, dest: &Path) -> Result<u64> {
        transfer(
            self.ctx.fetcher(),
            reference,
            dest,
            self.ctx.settings().download_chunk_size,
            &self.cancel,
            self.monitor.as_deref(),
        )
    }

    /// A logged working file next to `relative`, removed at close or abort.
    pub fn scratch_path(&mut self, relative: &str, tag: &str) -> Result<NormalizedPath> {
        self.ensure_accepting()?;
        let path = self.final_path(relative)?.with_suffix(&format!(".{tag}{TEMP_SUFFIX}"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.to_native()).map_err(|e| Error::io(parent.to_native(), e))?;
        }
        self.journal.append(LogEntryKind::BundleJarEntry, &path)?;
        self.scratch.push(path.clone());
        Ok(path)
    }

    /// Remove a scratch file early.
    pub fn discard_scratch(&mut self, path: &NormalizedPath) -> Result<()> {
        self.journal.append(LogEntryKind::Delete, path)?;
        update_fs::io::remove_path(&path.to_native())?;
        self.scratch.retain(|p| p != path);
        Ok(())
    }

    /// Drop the staged entry for `final_path` and delete its temp.
    ///
    /// Used when one plugin of a transaction is abandoned.
    pub(crate) fn unstage(&mut self, final_path: &NormalizedPath, report: &mut ConsumerReport) {
        let (dropped, kept): (Vec<Staged>, Vec<Staged>) = self
            .staged
            .drain(..)
            .partition(|s| s.final_path == *final_path);
        self.staged = kept;
        for staged in dropped {
            self.delete_logged(&staged.temp, report);
        }
    }

    pub(crate) fn delete_logged(&self, path: &NormalizedPath, report: &mut ConsumerReport) {
        if !path.exists() {
            return;
        }
        if let Err(e) = self.journal.append(LogEntryKind::Delete, path) {
            report.warn(format!("could not log delete of {path}: {e}"));
            report.recovery_inconsistent = true;
        }
        match update_fs::io::remove_path(&path.to_native()) {
            Ok(()) => report.removed.push(path.clone()),
            Err(e) => {
                report.warn(format!("could not delete {path}: {e}"));
                report.recovery_inconsistent = true;
            }
        }
    }

    pub fn staged_paths(&self) -> Vec<NormalizedPath> {
        self.staged.iter().map(|s| s.temp.clone()).collect()
    }
}

impl ContentConsumer for SiteContentConsumer<'_> {
    fn store(&mut self, reference: &ContentReference) -> Result<NormalizedPath> {
        self.stage_with(reference.identifier(), |consumer, temp| {
            consumer.transfer_to(reference, temp).map(|_| ())
        })
    }

    fn close(&mut self) -> Result<ConsumerReport> {
        if self.state.is_finished() {
            return Ok(ConsumerReport::repeated(self.state, "close"));
        }
        self.state = TransactionState::Closing;
        self.cancel.check()?;

        if let Some(existing) = self.staged.iter().find(|s| s.final_path.exists()) {
            return Err(Error::AlreadyExists {
                path: existing.final_path.to_native(),
            });
        }

        let mut report = ConsumerReport::default();
        for path in std::mem::take(&mut self.scratch) {
            self.delete_logged(&path, &mut report);
        }

        let staged = std::mem::take(&mut self.staged);
        for (idx, item) in staged.iter().enumerate() {
            // On failure the rest stays staged for abort.
            if let Err(e) = self.journal.append(LogEntryKind::Rename, &item.temp) {
                self.staged = staged[idx..].to_vec();
                return Err(e);
            }
            match update_fs::io::rename_no_replace(&item.temp.to_native(), &item.final_path.to_native()) {
                Ok(()) => {
                    self.renamed.push(item.final_path.clone());
                    report.committed.push(item.final_path.clone());
                }
                Err(e) => {
                    self.staged = staged[idx..].to_vec();
                    tracing::warn!(temp = %item.temp, path = %item.final_path, error = %e, "Commit rename failed");
                    return Err(match e {
                        update_fs::Error::Io { source, .. } if source.kind() == ErrorKind::AlreadyExists => {
                            Error::AlreadyExists {
                                path: item.final_path.to_native(),
                            }
                        }
                        other => Error::Fs(other),
                    });
                }
            }
        }

        self.state = TransactionState::Committed;
        tracing::info!(root = %self.root, committed = report.committed.len(), "Committed staged content");
        Ok(report)
    }

    fn abort(&mut self) -> ConsumerReport {
        if self.state.is_finished() {
            return ConsumerReport::repeated(self.state, "abort");
        }

        let mut report = ConsumerReport::default();
        let renamed = std::mem::take(&mut self.renamed);
        for path in renamed.iter().rev() {
            self.delete_logged(path, &mut report);
        }
        for staged in std::mem::take(&mut self.staged) {
            self.delete_logged(&staged.temp, &mut report);
        }
        for path in std::mem::take(&mut self.scratch) {
            self.delete_logged(&path, &mut report);
        }

        self.state = TransactionState::Aborted;
        tracing::info!(root = %self.root, removed = report.removed.len(), "Aborted staged content");
        report
    }

    fn state(&self) -> TransactionState {
        self.state
    }
}

impl Drop for SiteContentConsumer<'_> {
    fn drop(&mut self) {
        if !self.state.is_finished() && !self.staged.is_empty() {
            tracing::warn!(root = %self.root, state = %self.state, "Consumer dropped before close, aborting");
            self.abort();
        }
    }
}
