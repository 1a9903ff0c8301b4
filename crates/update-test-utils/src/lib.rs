//! Shared test utilities for the update-manager workspace.
//!
//! This crate provides fixtures used across crate test suites. It is a
//! dev-dependency only and never published.
//!
//! # Modules
//!
//! - [`archive`]: tar-backed plugin archives
//! - [`site`]: [`SiteFixture`] builder for local update sites

pub mod archive;
pub mod site;

pub use archive::{read_tar, write_tar};
pub use site::SiteFixture;

use update_model::{Version, VersionedIdentifier};

/// Parse `id` and `version` into an identifier, panicking on bad input.
pub fn vid(id: &str, version: &str) -> VersionedIdentifier {
    VersionedIdentifier::parse(id, version)
        .unwrap_or_else(|e| panic!("vid({id:?}, {version:?}): {e}"))
}

/// `id` at version `1.0.0`.
pub fn vid1(id: &str) -> VersionedIdentifier {
    VersionedIdentifier::new(id, Version::new(1, 0, 0))
}

/// Route `tracing` output to the test harness; `RUST_LOG` selects levels.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
