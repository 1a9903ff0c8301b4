//! Error types for update-model

use std::path::PathBuf;

/// Result type for update-model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or resolving the site and feature model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed version string.
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    /// Identifier that cannot name a feature or plugin.
    #[error("invalid identifier '{id}': {reason}")]
    InvalidIdentifier { id: String, reason: String },

    /// Manifest that failed to deserialize or validate.
    #[error("failed to parse manifest {path}: {message}")]
    ManifestParse { path: String, message: String },

    #[error("failed to serialize manifest: {0}")]
    ManifestSerialize(String),

    #[error("manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    /// A manifest location that could not be read.
    #[error("could not read {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// No factory registered for a site scheme or type.
    #[error("unknown site type '{0}'")]
    UnknownSiteType(String),

    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    /// A resolved feature was offered a replacement value.
    #[error("feature {0} is already resolved and read-only")]
    ReadOnlyFeature(String),

    /// Store requested on a site that can only be read.
    #[error("site {url} does not accept stored content")]
    NotStorable { url: String },

    #[error("dependency cycle among features: {}", participants.join(", "))]
    DependencyCycle { participants: Vec<String> },

    #[error(transparent)]
    Fs(#[from] update_fs::Error),
}
