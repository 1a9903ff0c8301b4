//! Filesystem primitives for the update manager
//!
//! Provides normalized paths, atomic and lock-guarded I/O, chunked copies
//! with interruption points, checksums and a format-agnostic config store.

pub mod checksum;
pub mod config;
pub mod error;
pub mod io;
pub mod path;

pub use config::ConfigStore;
pub use error::{Error, Result};
pub use io::{CopyOutcome, RobustnessConfig};
pub use path::{NormalizedPath, validate_path_component};
