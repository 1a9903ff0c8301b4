//! Replay of a recovery log after an interrupted run.
//!
//! [`RecoveryReport::from_log`] reconstructs, from the journal alone, what
//! state each logged path was left in. [`RecoveryReport::sweep`] then uses
//! the filesystem to finish or roll back whatever was left incomplete:
//! staged temp files and renamed files of an unfinished install are
//! removed, and pending deletes are carried out.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use update_fs::NormalizedPath;

use super::log::{ENTRY_PREFIX, EOF_MARKER, LogEntryKind, UNTAGGED};
use crate::Result;

/// Suffix of staged temp files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// One parsed journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub index: usize,
    /// Tag of the writing transaction, [`UNTAGGED`] for none.
    pub transaction: u64,
    pub kind: LogEntryKind,
    pub path: NormalizedPath,
}

/// What the journal says happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// A temp file was staged but its transaction never ended.
    StagedNotCommitted { rename_logged: bool },
    /// A delete was logged but its transaction never ended.
    DeletePending,
    /// Part of a transaction that reached its end marker.
    Committed,
}

/// Parse journal text. Unknown or malformed lines are skipped with a warning.
pub fn parse_log(content: &str) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == EOF_MARKER {
            continue;
        }
        match parse_line(line) {
            Some(record) => records.push(record),
            None => tracing::warn!(line, "Skipping malformed recovery log line"),
        }
    }
    records
}

fn parse_line(line: &str) -> Option<LogRecord> {
    let rest = line.strip_prefix(ENTRY_PREFIX)?;
    let (index, entry) = rest.split_once('=')?;
    let (kind, path) = entry.split_once(' ')?;
    let (kind, transaction) = match kind.split_once('@') {
        Some((kind, tag)) => (kind, tag.parse().ok()?),
        None => (kind, UNTAGGED),
    };
    Some(LogRecord {
        index: index.parse().ok()?,
        transaction,
        kind: kind.parse().ok()?,
        path: NormalizedPath::new(path),
    })
}

/// Outcome of replaying (and optionally sweeping) a recovery log.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub records: Vec<LogRecord>,
    pub states: BTreeMap<NormalizedPath, PathState>,
    /// Installed units recorded by FEATURE and PLUGIN markers.
    pub installed_units: Vec<NormalizedPath>,
    /// Logged transactions that never reached an end marker.
    pub incomplete_transactions: usize,
    /// Files removed by the sweep to undo unfinished installs.
    pub rolled_back: Vec<NormalizedPath>,
    /// Pending deletes finished by the sweep.
    pub completed_deletes: Vec<NormalizedPath>,
    /// Paths the sweep could not clean up, with the reason.
    pub failures: Vec<(NormalizedPath, String)>,
}

impl RecoveryReport {
    /// Replay journal records into per-path states.
    ///
    /// An end marker commits only the paths its own transaction logged;
    /// every transaction with open paths and no end marker is incomplete.
    pub fn from_records(records: Vec<LogRecord>) -> Self {
        let mut states = BTreeMap::new();
        let mut installed_units = Vec::new();
        let mut open: BTreeMap<u64, Vec<NormalizedPath>> = BTreeMap::new();

        for record in &records {
            let state = match record.kind {
                LogEntryKind::BundleJarEntry => PathState::StagedNotCommitted { rename_logged: false },
                LogEntryKind::Rename => PathState::StagedNotCommitted { rename_logged: true },
                LogEntryKind::Delete => PathState::DeletePending,
                LogEntryKind::Feature | LogEntryKind::Plugin => {
                    installed_units.push(record.path.clone());
                    continue;
                }
                LogEntryKind::EndInstall | LogEntryKind::EndRemove => {
                    for path in open.remove(&record.transaction).unwrap_or_default() {
                        states.insert(path, PathState::Committed);
                    }
                    continue;
                }
            };
            states.insert(record.path.clone(), state);
            open.entry(record.transaction).or_default().push(record.path.clone());
        }

        let incomplete_transactions = open.values().filter(|paths| !paths.is_empty()).count();
        tracing::debug!(records = records.len(), incomplete = incomplete_transactions, "Replayed recovery log");

        Self {
            records,
            states,
            installed_units,
            incomplete_transactions,
            ..Self::default()
        }
    }

    /// Read and replay the journal at `path`. A missing journal replays to
    /// an empty report.
    pub fn from_log(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| crate::Error::io(path, e))?;
        Ok(Self::from_records(parse_log(&content)))
    }

    pub fn state_of(&self, path: &NormalizedPath) -> Option<PathState> {
        self.states.get(path).copied()
    }

    /// Paths staged by a transaction that never ended.
    pub fn staged_not_committed(&self) -> Vec<&NormalizedPath> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, PathState::StagedNotCommitted { .. }))
            .map(|(path, _)| path)
            .collect()
    }

    pub fn needs_sweep(&self) -> bool {
        self.incomplete_transactions > 0
            || self
                .states
                .iter()
                .any(|(path, _)| path.as_str().ends_with(TEMP_SUFFIX) && path.exists())
    }

    /// Finish or roll back incomplete work on disk.
    pub fn sweep(&mut self) {
        let states: Vec<(NormalizedPath, PathState)> =
            self.states.iter().map(|(p, s)| (p.clone(), *s)).collect();

        for (path, state) in states {
            match state {
                PathState::StagedNotCommitted { rename_logged } => {
                    // The temp file, and the final file if the rename went through.
                    self.remove(&path, Outcome::RolledBack);
                    if rename_logged && let Some(final_path) = path.strip_suffix(TEMP_SUFFIX) {
                        self.remove(&final_path, Outcome::RolledBack);
                    }
                }
                PathState::DeletePending => self.remove(&path, Outcome::CompletedDelete),
                PathState::Committed => {
                    if path.as_str().ends_with(TEMP_SUFFIX) && path.exists() {
                        self.remove(&path, Outcome::RolledBack);
                    }
                }
            }
        }

        tracing::info!(
            rolled_back = self.rolled_back.len(),
            completed_deletes = self.completed_deletes.len(),
            failures = self.failures.len(),
            "Recovery sweep finished"
        );
    }

    fn remove(&mut self, path: &NormalizedPath, outcome: Outcome) {
        if !path.exists() {
            return;
        }
        match update_fs::io::remove_path(&path.to_native()) {
            Ok(()) => {
                tracing::info!(path = %path, "Recovered path");
                match outcome {
                    Outcome::RolledBack => self.rolled_back.push(path.clone()),
                    Outcome::CompletedDelete => self.completed_deletes.push(path.clone()),
                }
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Could not recover path");
                self.failures.push((path.clone(), e.to_string()));
            }
        }
    }
}

enum Outcome {
    RolledBack,
    CompletedDelete,
}
