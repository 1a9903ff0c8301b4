//! Crash-recovery journal and its replay.

mod log;
mod replay;

pub use log::{ENTRY_PREFIX, EOF_MARKER, ErrorRecoveryLog, LogEntryKind, LogTransaction, UNTAGGED};
pub use replay::{LogRecord, PathState, RecoveryReport, TEMP_SUFFIX, parse_log};
