//! Error types for update-core

use std::path::PathBuf;

/// Result type for update-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in update-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fetching an archive failed; callers usually offer a mirror switch.
    #[error("Download failed for archive {archive_id}: {source}")]
    DownloadFailed {
        archive_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A store would overwrite an existing file.
    #[error("Refusing to overwrite existing file {path}")]
    AlreadyExists { path: PathBuf },

    /// The recovery log could not be written. Fatal to the enclosing operation.
    #[error("Recovery log {path} could not be written: {source}")]
    RecoveryLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    /// The target site cannot receive content.
    #[error("Site {site} is not an install site")]
    NotInstallable { site: String },

    /// Removal of a feature that is still configured.
    #[error("Feature {feature} is still configured")]
    FeatureConfigured { feature: String },

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    /// A plugin that the transaction's feature does not declare.
    #[error("Plugin {plugin} is not part of feature {feature}")]
    UnknownPlugin { plugin: String, feature: String },

    #[error("Unknown configured site: {0}")]
    UnknownSite(String),

    /// Operation on a consumer or transaction that already closed or aborted.
    #[error("Content consumer is already {state}")]
    ConsumerClosed { state: String },

    /// Recovery requested while transactions still write to the log.
    #[error("{open} transaction(s) still open, recovery must wait")]
    TransactionsOpen { open: usize },

    #[error("No configuration snapshot at index {index}")]
    UnknownSnapshot { index: usize },

    #[error("Configuration history error at {path}: {message}")]
    History { path: PathBuf, message: String },

    // Transparent wrappers for underlying crate errors
    /// Model, manifest or version parse error from update-model
    #[error(transparent)]
    Model(#[from] update_model::Error),

    /// Filesystem error from update-fs
    #[error(transparent)]
    Fs(#[from] update_fs::Error),
}

impl Error {
    pub fn download(archive_id: impl Into<String>, source: std::io::Error) -> Self {
        Self::DownloadFailed {
            archive_id: archive_id.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Fs(update_fs::Error::io(path, source))
    }
}
