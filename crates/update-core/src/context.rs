//! Process-scoped services of one installation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use update_fs::NormalizedPath;
use update_model::{
    EnvironmentProvider, PlatformEnvironment, SiteTypeRegistry, SystemEnvironment,
};

use crate::download::{ContentFetcher, DefaultFetcher, MultiDownloadManager};
use crate::lock::LockManager;
use crate::recovery::{ErrorRecoveryLog, RecoveryReport};
use crate::remote::HttpSiteFactory;
use crate::settings::{STATE_DIR, SettingsResolver, UpdateSettings};
use crate::{Error, Result};

/// Recovery log, lock table, download limiter and site registry of one
/// installation, passed explicitly to every operation.
///
/// Opening a context replays and sweeps a recovery log left by an
/// interrupted run, then removes it.
pub struct UpdateContext {
    install_root: NormalizedPath,
    settings: UpdateSettings,
    log: ErrorRecoveryLog,
    locks: LockManager,
    downloads: Arc<MultiDownloadManager>,
    fetcher: Arc<dyn ContentFetcher>,
    registry: SiteTypeRegistry,
    environment: PlatformEnvironment,
    startup_recovery: RecoveryReport,
}

impl fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateContext")
            .field("install_root", &self.install_root)
            .field("environment", &self.environment)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl UpdateContext {
    /// Open `install_root` with settings resolved from disk.
    pub fn open(install_root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(install_root).build()
    }

    pub fn builder(install_root: impl Into<PathBuf>) -> UpdateContextBuilder {
        UpdateContextBuilder {
            install_root: NormalizedPath::new(install_root.into()),
            settings: None,
            user_config_dir: None,
            fetcher: None,
            environment: None,
            registry: None,
        }
    }

    pub fn install_root(&self) -> &NormalizedPath {
        &self.install_root
    }

    /// `<install>/.update`
    pub fn state_dir(&self) -> NormalizedPath {
        self.install_root.join(STATE_DIR)
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    pub fn log(&self) -> &ErrorRecoveryLog {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn downloads(&self) -> &Arc<MultiDownloadManager> {
        &self.downloads
    }

    pub fn fetcher(&self) -> &dyn ContentFetcher {
        self.fetcher.as_ref()
    }

    pub fn shared_fetcher(&self) -> Arc<dyn ContentFetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn registry(&self) -> &SiteTypeRegistry {
        &self.registry
    }

    pub fn environment(&self) -> &PlatformEnvironment {
        &self.environment
    }

    /// What the sweep at open time found and did.
    pub fn startup_recovery(&self) -> &RecoveryReport {
        &self.startup_recovery
    }

    /// Replay and sweep the recovery log, then remove it.
    ///
    /// The log is kept when the sweep could not clean every path, so a
    /// later attempt sees the same entries. Refused while any transaction
    /// of this context is open.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let open = self.log.open_transactions();
        if open > 0 {
            return Err(Error::TransactionsOpen { open });
        }
        self.log.close();
        let mut report = RecoveryReport::from_log(self.log.path())?;
        if report.records.is_empty() {
            self.log.delete()?;
            return Ok(report);
        }

        tracing::info!(
            log = %self.log.path().display(),
            entries = report.records.len(),
            incomplete = report.incomplete_transactions,
            "Replaying recovery log"
        );
        report.sweep();
        if report.failures.is_empty() {
            self.log.delete()?;
        } else {
            tracing::warn!(failures = report.failures.len(), "Recovery incomplete, keeping log");
            if let Some(last) = report.records.iter().map(|r| r.index).max() {
                let transaction = report.records.iter().map(|r| r.transaction).max().unwrap_or_default();
                self.log.resume_after(last, transaction);
            }
        }
        Ok(report)
    }

    /// Close the log after an operation; delete it when nothing is left
    /// for a recovery pass to do.
    ///
    /// The log stays open while other transactions of this context are
    /// still writing to it.
    pub fn finish_operation(&self, consistent: bool) -> Result<()> {
        let open = self.log.open_transactions();
        if open > 0 {
            tracing::debug!(open, "Transactions still open, keeping recovery log");
            return Ok(());
        }
        self.log.close();
        if consistent {
            self.log.delete()?;
        } else {
            tracing::warn!(log = %self.log.path().display(), "Operation left inconsistencies, keeping recovery log");
        }
        Ok(())
    }
}

/// Builder for [`UpdateContext`]; every part has a default.
pub struct UpdateContextBuilder {
    install_root: NormalizedPath,
    settings: Option<UpdateSettings>,
    user_config_dir: Option<PathBuf>,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    environment: Option<Arc<dyn EnvironmentProvider>>,
    registry: Option<SiteTypeRegistry>,
}

impl UpdateContextBuilder {
    /// Use `settings` instead of resolving the layered files.
    pub fn settings(mut self, settings: UpdateSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Read the user settings layer from `dir`.
    pub fn user_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_config_dir = Some(dir.into());
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn environment(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = Some(provider);
        self
    }

    /// Replace the default registry (`file`, `http`, `https`).
    pub fn registry(mut self, registry: SiteTypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<UpdateContext> {
        let settings = match self.settings {
            Some(settings) => settings,
            None => {
                let resolver = match self.user_config_dir {
                    Some(dir) => SettingsResolver::with_user_config_dir(self.install_root.clone(), dir),
                    None => SettingsResolver::new(self.install_root.clone()),
                };
                resolver.resolve()?
            }
        };

        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(DefaultFetcher::new()));
        let registry = self.registry.unwrap_or_else(|| {
            let mut registry = SiteTypeRegistry::with_defaults();
            let http = Arc::new(HttpSiteFactory::new(Arc::clone(&fetcher)));
            registry.register("http", http.clone());
            registry.register("https", http);
            registry
        });
        let provider = self.environment.unwrap_or_else(|| Arc::new(SystemEnvironment));
        let environment = provider.environment().with_overrides(&settings.environment);

        let state_dir = self.install_root.join(STATE_DIR);
        let log_path = state_dir.join(&settings.recovery_log_name).to_native();
        let log = ErrorRecoveryLog::new(log_path, settings.robustness().enable_fsync);

        let mut context = UpdateContext {
            downloads: Arc::new(MultiDownloadManager::new(
                settings.max_concurrent_downloads,
                settings.slot_poll_interval(),
            )),
            install_root: self.install_root,
            settings,
            log,
            locks: LockManager::new(),
            fetcher,
            registry,
            environment,
            startup_recovery: RecoveryReport::default(),
        };

        context.startup_recovery = context.recover()?;
        tracing::info!(
            install_root = %context.install_root,
            os = %context.environment.os,
            ws = %context.environment.ws,
            arch = %context.environment.arch,
            nl = %context.environment.nl,
            "Update context opened"
        );
        Ok(context)
    }
}
