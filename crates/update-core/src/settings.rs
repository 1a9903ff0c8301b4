//! Update manager settings with layered resolution
//!
//! Settings are merged from three layers, later ones overriding earlier:
//! 1. Built-in defaults
//! 2. User settings (`<config_dir>/update-manager/settings.toml`)
//! 3. Installation settings (`<install>/.update/settings.toml`)
//!
//! Missing layers are skipped; a layer that fails to parse is an error.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use update_fs::{ConfigStore, NormalizedPath, RobustnessConfig};
use update_model::EnvironmentOverrides;

use crate::Result;

/// Directory below an installation root holding update-manager state.
pub const STATE_DIR: &str = ".update";

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Number of superseded configurations kept for revert.
    pub history_size: usize,
    pub max_concurrent_downloads: usize,
    /// Wait between checks for a free download slot.
    pub slot_poll_interval_ms: u64,
    /// Copy granularity; cancellation is checked between chunks.
    pub download_chunk_size: usize,
    pub recovery_log_name: String,
    /// Budget for contended advisory file locks.
    pub lock_timeout_ms: u64,
    pub environment: EnvironmentOverrides,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            history_size: 50,
            max_concurrent_downloads: 5,
            slot_poll_interval_ms: 100,
            download_chunk_size: 4096,
            recovery_log_name: "error_recovery.log".to_string(),
            lock_timeout_ms: 5000,
            environment: EnvironmentOverrides::default(),
        }
    }
}

impl UpdateSettings {
    pub fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slot_poll_interval_ms)
    }

    pub fn robustness(&self) -> RobustnessConfig {
        RobustnessConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            ..RobustnessConfig::default()
        }
    }

    fn apply(&mut self, layer: SettingsLayer) {
        if let Some(v) = layer.history_size {
            self.history_size = v;
        }
        if let Some(v) = layer.max_concurrent_downloads {
            self.max_concurrent_downloads = v.max(1);
        }
        if let Some(v) = layer.slot_poll_interval_ms {
            self.slot_poll_interval_ms = v;
        }
        if let Some(v) = layer.download_chunk_size {
            self.download_chunk_size = v.max(1);
        }
        if let Some(v) = layer.recovery_log_name {
            self.recovery_log_name = v;
        }
        if let Some(v) = layer.lock_timeout_ms {
            self.lock_timeout_ms = v;
        }
        if let Some(env) = layer.environment {
            let merged = &mut self.environment;
            merged.os = env.os.or(merged.os.take());
            merged.ws = env.ws.or(merged.ws.take());
            merged.arch = env.arch.or(merged.arch.take());
            merged.nl = env.nl.or(merged.nl.take());
        }
    }
}

/// One settings file; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsLayer {
    history_size: Option<usize>,
    max_concurrent_downloads: Option<usize>,
    slot_poll_interval_ms: Option<u64>,
    download_chunk_size: Option<usize>,
    recovery_log_name: Option<String>,
    lock_timeout_ms: Option<u64>,
    environment: Option<EnvironmentOverrides>,
}

/// Resolves [`UpdateSettings`] for an installation.
pub struct SettingsResolver {
    install_root: NormalizedPath,
    /// Override for the user config directory (used for testing).
    user_config_dir_override: Option<PathBuf>,
}

impl SettingsResolver {
    pub fn new(install_root: NormalizedPath) -> Self {
        Self {
            install_root,
            user_config_dir_override: None,
        }
    }

    /// Use `dir` instead of the platform config directory for the user layer.
    pub fn with_user_config_dir(install_root: NormalizedPath, dir: PathBuf) -> Self {
        Self {
            install_root,
            user_config_dir_override: Some(dir),
        }
    }

    fn user_config_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.user_config_dir_override {
            return Some(dir.clone());
        }
        dirs::config_dir().map(|d| d.join("update-manager"))
    }

    /// Path of the installation layer.
    pub fn install_settings_path(&self) -> NormalizedPath {
        self.install_root.join(STATE_DIR).join(SETTINGS_FILE)
    }

    pub fn resolve(&self) -> Result<UpdateSettings> {
        let mut settings = UpdateSettings::default();

        if let Some(dir) = self.user_config_dir() {
            let path = NormalizedPath::new(dir.join(SETTINGS_FILE));
            load_layer(&mut settings, &path, "user")?;
        }

        load_layer(&mut settings, &self.install_settings_path(), "installation")?;

        Ok(settings)
    }

    /// Write `settings` as the installation layer.
    pub fn save_install_settings(&self, settings: &UpdateSettings) -> Result<()> {
        let store = ConfigStore::with_robustness(settings.robustness());
        store.save(&self.install_settings_path(), settings)?;
        Ok(())
    }
}

fn load_layer(settings: &mut UpdateSettings, path: &NormalizedPath, layer: &str) -> Result<()> {
    if !path.is_file() {
        tracing::debug!(path = %path, layer, "No settings layer found, skipping");
        return Ok(());
    }
    tracing::debug!(path = %path, layer, "Loading settings layer");
    let parsed: SettingsLayer = ConfigStore::new().load(path)?;
    settings.apply(parsed);
    Ok(())
}
