//! Append-only journal of pending destructive filesystem actions.
//!
//! Every store, rename and delete performed by a transaction is appended
//! here before it happens. Lines look like:
//!
//! ```text
//! LogEntry.0=BUNDLE_JAR_ENTRY@1 /install/plugins/a_1.0.0.jar.tmp
//! LogEntry.1=BUNDLE_JAR_ENTRY@2 /install/plugins/b_1.0.0.jar.tmp
//! LogEntry.2=RENAME@1 /install/plugins/a_1.0.0.jar.tmp
//! LogEntry.3=PLUGIN@1 /install/plugins/a_1.0.0.jar
//! LogEntry.4=END_INSTALL@1 /install/features/f_1.0.0
//! eof=eof
//! ```
//!
//! The `@N` tag names the [`LogTransaction`] that wrote the entry, so the
//! entries of concurrent transactions can be told apart on replay. Entries
//! written outside a transaction carry no tag.
//!
//! The file is opened lazily on the first append. [`ErrorRecoveryLog::close`]
//! writes the `eof=eof` sentinel and releases the handle; a later append
//! reopens the file in append mode and keeps numbering.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use update_fs::NormalizedPath;

use crate::{Error, Result};

/// Prefix of numbered entries.
pub const ENTRY_PREFIX: &str = "LogEntry.";

/// Terminal sentinel written by [`ErrorRecoveryLog::close`].
pub const EOF_MARKER: &str = "eof=eof";

/// Transaction tag of entries written outside any transaction.
pub const UNTAGGED: u64 = 0;

/// Kind of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryKind {
    /// A temp file is about to be staged.
    BundleJarEntry,
    /// A staged temp file is about to be renamed to its final path.
    Rename,
    /// A file or directory is about to be removed.
    Delete,
    /// A feature was installed at this path.
    Feature,
    /// A plugin was installed at this path.
    Plugin,
    EndInstall,
    EndRemove,
}

impl LogEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BundleJarEntry => "BUNDLE_JAR_ENTRY",
            Self::Rename => "RENAME",
            Self::Delete => "DELETE",
            Self::Feature => "FEATURE",
            Self::Plugin => "PLUGIN",
            Self::EndInstall => "END_INSTALL",
            Self::EndRemove => "END_REMOVE",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::EndInstall | Self::EndRemove)
    }
}

impl fmt::Display for LogEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogEntryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "BUNDLE_JAR_ENTRY" => Self::BundleJarEntry,
            "RENAME" => Self::Rename,
            "DELETE" => Self::Delete,
            "FEATURE" => Self::Feature,
            "PLUGIN" => Self::Plugin,
            "END_INSTALL" => Self::EndInstall,
            "END_REMOVE" => Self::EndRemove,
            other => return Err(format!("unknown log entry kind '{other}'")),
        })
    }
}

#[derive(Debug, Default)]
struct LogState {
    file: Option<File>,
    next_index: usize,
}

/// The recovery journal of one installation.
///
/// Shared by every transaction of an [`UpdateContext`](crate::UpdateContext);
/// appends are serialized by an internal mutex. The log also counts the
/// [`LogTransaction`]s still alive, and must not be deleted while any are.
#[derive(Debug)]
pub struct ErrorRecoveryLog {
    path: PathBuf,
    sync: bool,
    state: Mutex<LogState>,
    next_transaction: AtomicU64,
    open_transactions: AtomicUsize,
}

impl ErrorRecoveryLog {
    /// Journal at `path`. With `sync`, each entry is flushed to disk before
    /// `append` returns.
    pub fn new(path: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            path: path.into(),
            sync,
            state: Mutex::new(LogState::default()),
            next_transaction: AtomicU64::new(UNTAGGED + 1),
            open_transactions: AtomicUsize::new(0),
        }
    }

    /// Start tagging entries for one transaction.
    ///
    /// The transaction counts as open until the returned handle is dropped.
    pub fn begin_transaction(&self) -> LogTransaction<'_> {
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        self.open_transactions.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(transaction = id, "Recovery log transaction opened");
        LogTransaction { log: self, id }
    }

    /// Number of [`LogTransaction`] handles not yet dropped.
    pub fn open_transactions(&self) -> usize {
        self.open_transactions.load(Ordering::Acquire)
    }

    /// Continue numbering after a log kept from an earlier run.
    pub(crate) fn resume_after(&self, last_index: usize, last_transaction: u64) {
        self.lock().next_index = last_index + 1;
        self.next_transaction
            .fetch_max(last_transaction + 1, Ordering::Relaxed);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, source: std::io::Error) -> Error {
        Error::RecoveryLog {
            path: self.path.clone(),
            source,
        }
    }

    /// Record an action on `path` before performing it.
    ///
    /// Returns the entry number. A failure here must abort the caller's
    /// filesystem mutation.
    pub fn append(&self, kind: LogEntryKind, path: &NormalizedPath) -> Result<usize> {
        self.write_entry(UNTAGGED, kind, path)
    }

    fn write_entry(&self, transaction: u64, kind: LogEntryKind, path: &NormalizedPath) -> Result<usize> {
        let mut state = self.lock();

        if state.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| self.fail(e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| self.fail(e))?;
            tracing::debug!(path = %self.path.display(), "Opened recovery log");
            state.file = Some(file);
        }

        let index = state.next_index;
        let line = if transaction == UNTAGGED {
            format!("{ENTRY_PREFIX}{index}={kind} {path}\n")
        } else {
            format!("{ENTRY_PREFIX}{index}={kind}@{transaction} {path}\n")
        };
        let sync = self.sync;
        let Some(file) = state.file.as_mut() else {
            return Err(self.fail(std::io::Error::other("recovery log handle missing")));
        };
        file.write_all(line.as_bytes()).map_err(|e| self.fail(e))?;
        file.flush().map_err(|e| self.fail(e))?;
        if sync {
            file.sync_data().map_err(|e| self.fail(e))?;
        }

        state.next_index += 1;
        tracing::trace!(index, transaction, kind = %kind, path = %path, "Recovery log entry");
        Ok(index)
    }

    /// Whether the journal currently holds an open handle.
    pub fn is_open(&self) -> bool {
        self.lock().file.is_some()
    }

    /// Write the end-of-file sentinel and release the handle.
    ///
    /// Idempotent; failures are logged and swallowed.
    pub fn close(&self) {
        let mut state = self.lock();
        let Some(mut file) = state.file.take() else {
            return;
        };
        let result = file
            .write_all(format!("{EOF_MARKER}\n").as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all());
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not finalize recovery log");
        }
    }

    /// Close and remove the journal. Used once every logged action is known
    /// to have completed.
    pub fn delete(&self) -> Result<()> {
        self.close();
        let mut state = self.lock();
        state.next_index = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed recovery log");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// Entries of one install or remove transaction.
#[derive(Debug)]
pub struct LogTransaction<'a> {
    log: &'a ErrorRecoveryLog,
    id: u64,
}

impl LogTransaction<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record an action of this transaction before performing it.
    pub fn append(&self, kind: LogEntryKind, path: &NormalizedPath) -> Result<usize> {
        self.log.write_entry(self.id, kind, path)
    }
}

impl Drop for LogTransaction<'_> {
    fn drop(&mut self) {
        self.log.open_transactions.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(transaction = self.id, "Recovery log transaction closed");
    }
}

impl Drop for ErrorRecoveryLog {
    fn drop(&mut self) {
        self.close();
    }
}
