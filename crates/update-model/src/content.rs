//! Handles to content that can be stored into a site.

use std::fmt;
use std::path::PathBuf;

use url::Url;

/// Where the bytes of a [`ContentReference`] live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    /// A loose file on the local filesystem.
    Local(PathBuf),
    /// A remote resource fetched over HTTP(S).
    Remote(Url),
    /// One entry inside a local archive.
    ArchiveEntry { archive: PathBuf, entry: String },
}

/// A chunk of bytes with an identifier.
///
/// The identifier is the archive id for plugin archives
/// (`plugins/<id>_<version>.jar`) or the relative path for loose files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentReference {
    identifier: String,
    source: ContentSource,
    size: Option<u64>,
    checksum: Option<String>,
}

impl ContentReference {
    pub fn new(identifier: impl Into<String>, source: ContentSource) -> Self {
        Self {
            identifier: identifier.into(),
            source,
            size: None,
            checksum: None,
        }
    }

    pub fn local(identifier: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(identifier, ContentSource::Local(path.into()))
    }

    pub fn remote(identifier: impl Into<String>, url: Url) -> Self {
        Self::new(identifier, ContentSource::Remote(url))
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// Expected `sha256:<hex>` digest of the content.
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn source(&self) -> &ContentSource {
        &self.source
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, ContentSource::Remote(_))
    }

    /// Same content, now available at a local path.
    pub fn relocated(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            source: ContentSource::Local(path.into()),
            ..self.clone()
        }
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ContentSource::Local(path) => write!(f, "{} ({})", self.identifier, path.display()),
            ContentSource::Remote(url) => write!(f, "{} ({url})", self.identifier),
            ContentSource::ArchiveEntry { archive, entry } => {
                write!(f, "{} ({}!{entry})", self.identifier, archive.display())
            }
        }
    }
}
