//! Local configuration: which sites are bound into the installation and
//! which of their features are active, with a persisted history for revert.

mod configured_site;
mod history;
mod install_configuration;
mod policy;

pub use configured_site::{ConfiguredSite, FeatureStatus};
pub use history::{ConfigurationHistory, HISTORY_FILE};
pub use install_configuration::{
    ActivityAction, ActivityStatus, ConfigurationActivity, InstallConfiguration,
};
pub use policy::{ConfigurationPolicy, PolicyKind};
