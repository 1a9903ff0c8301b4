//! Reading content references and transferring them to local files.

use std::fs::{self, File};
use std::io::{Cursor, ErrorKind, Read};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use update_fs::CopyOutcome;
use update_model::{ContentReference, ContentSource};

use super::manager::CancellationToken;
use super::monitor::DownloadMonitor;
use crate::{Error, Result};

/// Opens the byte stream behind a [`ContentReference`].
///
/// Local files, archive entries and remote resources are handled alike;
/// every failure is a [`Error::DownloadFailed`] naming the archive.
pub trait ContentFetcher: Send + Sync {
    fn open(&self, reference: &ContentReference) -> Result<Box<dyn Read + Send>>;
}

/// Fetcher for local paths, tar entries and HTTP(S) URLs.
#[derive(Debug, Default)]
pub struct DefaultFetcher {
    timeout: Option<Duration>,
    client: OnceLock<reqwest::blocking::Client>,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            client: OnceLock::new(),
        }
    }

    fn client(&self, archive_id: &str) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(concat!("update-manager/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::download(archive_id, std::io::Error::other(e)))?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl ContentFetcher for DefaultFetcher {
    fn open(&self, reference: &ContentReference) -> Result<Box<dyn Read + Send>> {
        let id = reference.identifier();
        match reference.source() {
            ContentSource::Local(path) => {
                let file = File::open(path).map_err(|e| Error::download(id, e))?;
                Ok(Box::new(file))
            }
            ContentSource::ArchiveEntry { archive, entry } => {
                let bytes = read_archive_entry(archive, entry).map_err(|e| Error::download(id, e))?;
                Ok(Box::new(Cursor::new(bytes)))
            }
            ContentSource::Remote(url) => {
                tracing::debug!(archive = id, url = %url, "Requesting remote content");
                let response = self
                    .client(id)?
                    .get(url.clone())
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::download(id, std::io::Error::other(e)))?;
                Ok(Box::new(response))
            }
        }
    }
}

fn read_archive_entry(archive: &Path, name: &str) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(File::open(archive)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(name) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    Err(std::io::Error::new(
        ErrorKind::NotFound,
        format!("entry '{name}' not found in archive"),
    ))
}

/// Copy `reference` to `dest` in chunks, honouring cancellation between
/// chunks and verifying a declared checksum.
///
/// On cancellation or checksum mismatch the partial file is removed.
pub fn transfer(
    fetcher: &dyn ContentFetcher,
    reference: &ContentReference,
    dest: &Path,
    chunk_size: usize,
    cancel: &CancellationToken,
    monitor: Option<&DownloadMonitor>,
) -> Result<u64> {
    cancel.check()?;
    let id = reference.identifier();
    let mut reader = fetcher.open(reference)?;
    if let (Some(monitor), Some(size)) = (monitor, reference.size()) {
        monitor.expect(id, size);
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let mut file = File::create(dest).map_err(|e| Error::io(dest, e))?;

    let remote = reference.is_remote();
    let outcome = update_fs::io::copy_chunked(&mut reader, &mut file, chunk_size, dest, |n| {
        if let Some(monitor) = monitor {
            monitor.copied(n);
        }
        if cancel.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .map_err(|e| match e {
        update_fs::Error::Io { source, .. } if remote => Error::download(id, source),
        other => Error::Fs(other),
    });
    drop(file);

    let bytes = match outcome {
        Ok(CopyOutcome::Completed(bytes)) => bytes,
        Ok(CopyOutcome::Interrupted(bytes)) => {
            tracing::info!(archive = id, bytes, "Transfer cancelled");
            discard(dest);
            return Err(Error::Cancelled);
        }
        Err(e) => {
            discard(dest);
            return Err(e);
        }
    };

    if let Some(expected) = reference.checksum() {
        let matches = update_fs::checksum::verify_file_checksum(dest, expected)?;
        if !matches {
            discard(dest);
            return Err(Error::download(
                id,
                std::io::Error::new(ErrorKind::InvalidData, format!("checksum mismatch, expected {expected}")),
            ));
        }
    }

    tracing::debug!(archive = id, bytes, dest = %dest.display(), "Transfer complete");
    Ok(bytes)
}

fn discard(path: &Path) {
    if let Err(e) = update_fs::io::remove_path(path) {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove partial transfer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn local_transfer_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.jar");
        fs::write(&source, b"plugin bytes").unwrap();
        let checksum = update_fs::checksum::compute_bytes_checksum(b"plugin bytes");
        let reference = ContentReference::local("plugins/a.jar", &source)
            .with_size(Some(12))
            .with_checksum(Some(checksum));
        let monitor = DownloadMonitor::new();
        let dest = dir.path().join("out/a.jar");

        let bytes = transfer(&DefaultFetcher::new(), &reference, &dest, 4, &CancellationToken::new(), Some(&monitor)).unwrap();

        assert_eq!(bytes, 12);
        assert_eq!(fs::read(&dest).unwrap(), b"plugin bytes");
        assert_eq!(monitor.snapshot().percent, 100);
    }

    #[test]
    fn checksum_mismatch_is_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.jar");
        fs::write(&source, b"tampered").unwrap();
        let reference = ContentReference::local("plugins/a.jar", &source)
            .with_checksum(Some(update_fs::checksum::compute_bytes_checksum(b"original")));
        let dest = dir.path().join("a.copy");

        let err = transfer(&DefaultFetcher::new(), &reference, &dest, 4096, &CancellationToken::new(), None).unwrap_err();

        assert!(matches!(err, Error::DownloadFailed { ref archive_id, .. } if archive_id == "plugins/a.jar"));
        assert!(!dest.exists());
    }

    #[test]
    fn missing_source_names_archive() {
        let dir = tempfile::tempdir().unwrap();
        let reference = ContentReference::local("plugins/missing.jar", dir.path().join("missing.jar"));
        let err = DefaultFetcher::new().open(&reference).err().unwrap();
        assert!(matches!(err, Error::DownloadFailed { ref archive_id, .. } if archive_id == "plugins/missing.jar"));
    }

    #[test]
    fn cancelled_transfer_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.jar");
        fs::write(&source, vec![0u8; 64 * 1024]).unwrap();
        let reference = ContentReference::local("plugins/big.jar", &source);
        let dest = dir.path().join("big.copy");
        let cancel = CancellationToken::new();
        let monitor = DownloadMonitor::with_listener({
            let cancel = cancel.clone();
            move |s| {
                if s.copied >= 1024 {
                    cancel.cancel();
                }
            }
        });

        let err = transfer(&DefaultFetcher::new(), &reference, &dest, 1024, &cancel, Some(&monitor)).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn reads_single_archive_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("feature.jar");
        write_tar(&archive, &[("feature.toml", b"[feature]"), ("license.txt", b"MIT")]);
        let reference = ContentReference::new(
            "features/f/license.txt",
            ContentSource::ArchiveEntry {
                archive: archive.clone(),
                entry: "license.txt".into(),
            },
        );

        let mut content = String::new();
        DefaultFetcher::new()
            .open(&reference)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "MIT");
    }
}
