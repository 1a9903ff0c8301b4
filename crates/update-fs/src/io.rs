//! Atomic I/O operations with file locking

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use fs2::FileExt;

use crate::{Error, NormalizedPath, Result};

/// Tuning for lock acquisition and durability of atomic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobustnessConfig {
    /// How long to keep retrying a contended advisory lock.
    pub lock_timeout: Duration,
    /// Whether to `fsync` temp files before the rename.
    pub enable_fsync: bool,
}

impl Default for RobustnessConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            enable_fsync: true,
        }
    }
}

/// Result of a chunked copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The reader was drained; total bytes copied.
    Completed(u64),
    /// The chunk callback asked to stop; bytes copied so far.
    Interrupted(u64),
}

impl CopyOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Completed(n) | Self::Interrupted(n) => *n,
        }
    }
}

/// Acquire an exclusive advisory lock, retrying with exponential backoff
/// until `timeout` has elapsed.
pub fn lock_exclusive_with_timeout(file: &File, path: &Path, timeout: Duration) -> Result<()> {
    let mut policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(250),
        max_elapsed_time: Some(timeout),
        ..ExponentialBackoff::default()
    };
    policy.reset();

    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(_) => match policy.next_backoff() {
                Some(wait) => std::thread::sleep(wait),
                None => {
                    return Err(Error::LockFailed {
                        path: path.to_path_buf(),
                    });
                }
            },
        }
    }
}

/// Write content atomically to a file with locking.
///
/// A sibling `<file>.lock` serializes writers; content goes to a temp file
/// in the same directory and is renamed over the target.
pub fn write_atomic(path: &NormalizedPath, content: &[u8], config: RobustnessConfig) -> Result<()> {
    let native_path = path.to_native();

    if let Some(parent) = native_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let lock_path = path.with_suffix(".lock").to_native();
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| Error::io(&lock_path, e))?;
    lock_exclusive_with_timeout(&lock_file, &native_path, config.lock_timeout)?;

    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or("unnamed"),
        std::process::id()
    );
    let temp_path = native_path.with_file_name(&temp_name);

    let mut temp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| Error::io(&temp_path, e))?;

    temp_file
        .write_all(content)
        .map_err(|e| Error::io(&temp_path, e))?;

    if config.enable_fsync {
        temp_file
            .sync_all()
            .map_err(|e| Error::io(&temp_path, e))?;
    }
    drop(temp_file);

    fs::rename(&temp_path, &native_path).map_err(|e| Error::io(&native_path, e))?;

    FileExt::unlock(&lock_file).map_err(|_| Error::LockFailed {
        path: native_path.clone(),
    })?;

    Ok(())
}

/// Read text content from a file.
pub fn read_text(path: &NormalizedPath) -> Result<String> {
    let native_path = path.to_native();
    fs::read_to_string(&native_path).map_err(|e| Error::io(&native_path, e))
}

/// Write text content to a file atomically with default robustness.
pub fn write_text(path: &NormalizedPath, content: &str) -> Result<()> {
    write_atomic(path, content.as_bytes(), RobustnessConfig::default())
}

/// Copy `reader` into `writer` in `chunk_size` pieces.
///
/// `on_chunk` runs after every chunk with the byte count of that chunk and
/// may break to stop the copy. `dest` is only used for error context.
pub fn copy_chunked<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    dest: &Path,
    mut on_chunk: F,
) -> Result<CopyOutcome>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64) -> ControlFlow<()>,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(dest, e)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|e| Error::io(dest, e))?;
        total += read as u64;

        if on_chunk(read as u64).is_break() {
            writer.flush().map_err(|e| Error::io(dest, e))?;
            return Ok(CopyOutcome::Interrupted(total));
        }
    }

    writer.flush().map_err(|e| Error::io(dest, e))?;
    Ok(CopyOutcome::Completed(total))
}

/// Remove a file or a directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Move `from` to `to`, failing with [`ErrorKind::AlreadyExists`] instead of
/// replacing an existing target.
///
/// Files are hard-linked to the target and then unlinked from the source,
/// so the existence check and the move are one step. Directories, and
/// filesystems without hard links, fall back to check-then-rename.
pub fn rename_no_replace(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        match fs::hard_link(from, to) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(from) {
                    let _ = fs::remove_file(to);
                    return Err(Error::io(from, e));
                }
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::io(to, e)),
            Err(e) if matches!(e.kind(), ErrorKind::Unsupported | ErrorKind::PermissionDenied) => {
                tracing::debug!(path = %to.display(), error = %e, "Hard link unavailable, renaming");
            }
            Err(e) => return Err(Error::io(from, e)),
        }
    }

    if to.exists() {
        return Err(Error::io(
            to,
            std::io::Error::new(ErrorKind::AlreadyExists, "target already exists"),
        ));
    }
    fs::rename(from, to).map_err(|e| Error::io(from, e))
}

/// Remove empty directories bottom-up below and including `path`.
///
/// Returns the number of directories removed. Failures are logged and
/// skipped; this only tidies up after an uninstall.
pub fn remove_empty_dirs(path: &Path) -> usize {
    if !path.is_dir() {
        return 0;
    }

    let mut removed = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            removed += remove_empty_dirs(&entry.path());
        }
    }

    let is_empty = fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none());
    if is_empty {
        match fs::remove_dir(path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "could not remove empty directory"),
        }
    }
    removed
}
