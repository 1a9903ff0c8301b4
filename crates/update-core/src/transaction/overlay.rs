//! Plugin archive helpers: delta overlays and unpacking.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Entry counts of an overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    /// Entries taken from the delta archive.
    pub from_delta: usize,
    /// Entries carried forward from the installed archive.
    pub carried: usize,
}

/// Build `out` from `delta` plus every entry of `base` the delta does not
/// replace.
///
/// Delta entries are written first, in delta order; carried entries follow
/// in base order.
pub fn overlay_archive(base: &Path, delta: &Path, out: &Path) -> io::Result<OverlayStats> {
    let mut builder = tar::Builder::new(File::create(out)?);
    let mut stats = OverlayStats::default();
    let mut replaced: BTreeSet<PathBuf> = BTreeSet::new();

    let mut delta_archive = tar::Archive::new(File::open(delta)?);
    for entry in delta_archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut header = entry.header().clone();
        builder.append_data(&mut header, &path, &mut entry)?;
        replaced.insert(path);
        stats.from_delta += 1;
    }

    let mut base_archive = tar::Archive::new(File::open(base)?);
    for entry in base_archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if replaced.contains(&path) {
            continue;
        }
        let mut header = entry.header().clone();
        builder.append_data(&mut header, &path, &mut entry)?;
        stats.carried += 1;
    }

    builder.into_inner()?.sync_all()?;
    tracing::debug!(
        base = %base.display(),
        delta = %delta.display(),
        from_delta = stats.from_delta,
        carried = stats.carried,
        "Overlaid plugin archive"
    );
    Ok(stats)
}

/// Extract `archive` into `dest`, creating it. Returns the entry count.
///
/// Entries that would escape `dest` are skipped.
pub fn unpack_archive(archive: &Path, dest: &Path) -> io::Result<usize> {
    fs::create_dir_all(dest)?;
    let mut reader = tar::Archive::new(File::open(archive)?);
    let mut count = 0;
    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.unpack_in(dest)? {
            count += 1;
        } else {
            tracing::warn!(archive = %archive.display(), "Skipped archive entry outside the target directory");
        }
    }
    Ok(count)
}
