//! Transactional install, recovery and configuration engine for the
//! update manager
//!
//! This crate turns the model of `update-model` into changes on disk:
//!
//! - **Recovery log**: append-only journal written before every destructive
//!   file operation, replayed and swept at start-up
//! - **Transactions**: staged install and remove of one feature, with
//!   temp-then-rename commit and logged abort
//! - **Downloads**: bounded concurrent transfers with cancellation and
//!   progress monitoring
//! - **Configuration**: configured sites, policies and the persisted
//!   snapshot history
//! - **UpdateEngine**: install, remove, configure, unconfigure and revert
//!
//! # Architecture
//!
//! ```text
//!                 UpdateEngine
//!                      |
//!       +--------------+---------------+
//!       |              |               |
//!  transaction    configuration     remote
//!       |              |               |
//!   recovery, lock, download      UpdateContext
//!                      |
//!              update-model, update-fs
//! ```
//!
//! # Example
//!
//! ```ignore
//! use update_core::{InstallOptions, UpdateContext, UpdateEngine};
//!
//! let engine = UpdateEngine::new(UpdateContext::open("/opt/app")?)?;
//! let site = engine.resolve(&"https://updates.example.com/site/".parse()?)?;
//! let (features, _excluded) = engine.available_features(&site);
//! let install_site = engine.current_configuration().install_site().unwrap().url().clone();
//! let report = engine.install_feature(&features[0], &install_site, &InstallOptions::default())?;
//! ```

pub mod configuration;
pub mod context;
pub mod download;
pub mod engine;
pub mod error;
pub mod lock;
pub mod recovery;
pub mod remote;
pub mod settings;
pub mod transaction;

pub use configuration::{
    ActivityAction, ActivityStatus, ConfigurationActivity, ConfigurationHistory,
    ConfigurationPolicy, ConfiguredSite, FeatureStatus, InstallConfiguration, PolicyKind,
};
pub use context::{UpdateContext, UpdateContextBuilder};
pub use download::{CancellationToken, ContentFetcher, DefaultFetcher, DownloadMonitor, MultiDownloadManager};
pub use engine::{BatchReport, InstallOptions, UnitOutcome, UnitStatus, UpdateEngine};
pub use error::{Error, Result};
pub use lock::{LockGuard, LockManager};
pub use recovery::{ErrorRecoveryLog, LogEntryKind, RecoveryReport};
pub use remote::HttpSiteFactory;
pub use settings::{SettingsResolver, UpdateSettings};
pub use transaction::{
    ConsumerReport, ContentConsumer, InstallTransaction, RemoveTransaction, SiteContentConsumer,
    TransactionState,
};
