//! End-to-end installation lifecycle against local sites: settings files,
//! crash recovery on reopen and install/remove round trips.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use assert_fs::prelude::*;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use url::Url;

use update_core::{
    ActivityAction, InstallOptions, UnitStatus, UpdateContext, UpdateEngine, UpdateSettings,
};
use update_model::{EnvironmentFilter, Feature, FeatureReference, PlatformEnvironment, PluginEntry};
use update_test_utils::{SiteFixture, init_tracing, vid1};

fn linux() -> Arc<PlatformEnvironment> {
    Arc::new(PlatformEnvironment::new("linux", "gtk", "x86_64", "en_US"))
}

/// Engine whose settings come from the installation's own settings file.
fn engine_from_files(root: &Path, user_config: &Path) -> UpdateEngine {
    init_tracing();
    let ctx = UpdateContext::builder(root)
        .user_config_dir(user_config)
        .environment(linux())
        .build()
        .unwrap();
    UpdateEngine::new(ctx).unwrap()
}

fn engine(root: &Path) -> UpdateEngine {
    init_tracing();
    let ctx = UpdateContext::builder(root)
        .settings(UpdateSettings::default())
        .environment(linux())
        .build()
        .unwrap();
    UpdateEngine::new(ctx).unwrap()
}

fn write_install_settings(root: &Path, content: &str) {
    let dir = root.join(".update");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("settings.toml"), content).unwrap();
}

fn tools_feature() -> Feature {
    Feature::builder(vid1("org.example.tools"))
        .plugin(PluginEntry::new(vid1("org.example.tools.core")))
        .build()
        .unwrap()
}

fn find(engine: &UpdateEngine, site: &Url, id: &str) -> FeatureReference {
    engine.resolve(site).unwrap().find_feature(&vid1(id)).unwrap()
}

#[test]
fn reopening_after_a_crash_rolls_back_staged_files() {
    let root = TempDir::new().unwrap();
    let mut source = SiteFixture::new();
    source.add_feature(&tools_feature());
    let staged = root.path().join("plugins/org.example.tools.core_1.0.0.jar.tmp");
    let log = root.path().join(".update/error_recovery.log");

    {
        let engine = engine(root.path());
        let target = Url::from_directory_path(root.path()).unwrap();
        let feature = find(&engine, &source.url(), "org.example.tools").feature().unwrap();
        let site = engine.resolve(&source.url()).unwrap();
        let entry = feature.plugins()[0].clone();

        let mut tx = engine.begin_install(Arc::clone(&feature), &target).unwrap();
        tx.store_plugin(&entry, &site.plugin_content(&entry).unwrap()).unwrap();
        assert!(staged.is_file());
        assert!(log.is_file());
        // Simulate the process dying before close or abort.
        std::mem::forget(tx);
    }

    let engine = engine(root.path());
    let report = engine.context().startup_recovery();

    assert_eq!(report.incomplete_transactions, 1);
    assert!(!staged.exists());
    assert!(!root.path().join("plugins/org.example.tools.core_1.0.0.jar").exists());
    assert!(!log.exists());
    let target = Url::from_directory_path(root.path()).unwrap();
    assert!(engine.resolve(&target).unwrap().find_feature(&vid1("org.example.tools")).is_none());
}

#[test]
fn installation_settings_bound_the_history() {
    let root = TempDir::new().unwrap();
    let user_config = TempDir::new().unwrap();
    write_install_settings(root.path(), "history_size = 3\n");
    let mut source = SiteFixture::new();
    source.add_feature(&tools_feature());

    let engine = engine_from_files(root.path(), user_config.path());
    assert_eq!(engine.context().settings().history_size, 3);
    let target = Url::from_directory_path(root.path()).unwrap();

    engine
        .install_feature(&find(&engine, &source.url(), "org.example.tools"), &target, &InstallOptions::default())
        .unwrap();
    let installed = find(&engine, &target, "org.example.tools");
    engine.unconfigure(&installed, &target).unwrap();
    engine.configure(&installed, &target).unwrap();
    engine.unconfigure(&installed, &target).unwrap();

    let snapshots = engine.snapshots();
    assert_eq!(snapshots.len(), 3);
    assert_eq!(
        snapshots.last().unwrap().activities().last().unwrap().action,
        ActivityAction::Unconfigure
    );

    drop(engine);
    let reopened = engine_from_files(root.path(), user_config.path());
    assert_eq!(reopened.snapshots().len(), 3);
}

#[test]
fn environment_override_in_settings_filters_features() {
    let root = TempDir::new().unwrap();
    let user_config = TempDir::new().unwrap();
    write_install_settings(root.path(), "[environment]\nos = \"win32\"\n");
    let mut source = SiteFixture::new();
    source.add_feature(
        &Feature::builder(vid1("org.example.gtk"))
            .environment(EnvironmentFilter::any().with_os("linux"))
            .plugin(PluginEntry::new(vid1("org.example.gtk.plugin")))
            .build()
            .unwrap(),
    );

    let engine = engine_from_files(root.path(), user_config.path());
    assert_eq!(engine.context().environment().os, "win32");
    let target = Url::from_directory_path(root.path()).unwrap();

    let site = engine.resolve(&source.url()).unwrap();
    let (available, filtered) = engine.available_features(&site);
    assert!(available.is_empty());
    assert_eq!(filtered.excluded.len(), 1);

    let report = engine
        .install_feature(&find(&engine, &source.url(), "org.example.gtk"), &target, &InstallOptions::default())
        .unwrap();
    assert!(matches!(
        report.outcome(&vid1("org.example.gtk")).unwrap().status,
        UnitStatus::Skipped { .. }
    ));
    assert!(!root.path().join("plugins/org.example.gtk.plugin_1.0.0.jar").exists());
}

#[test]
fn install_remove_and_reinstall() {
    let root = assert_fs::TempDir::new().unwrap();
    let mut source = SiteFixture::new();
    source.add_feature(&tools_feature());
    let engine = engine(root.path());
    let target = Url::from_directory_path(root.path()).unwrap();
    let jar = root.child("plugins/org.example.tools.core_1.0.0.jar");
    let manifest = root.child("features/org.example.tools_1.0.0/feature.toml");

    let report = engine
        .install_feature(&find(&engine, &source.url(), "org.example.tools"), &target, &InstallOptions::default())
        .unwrap();
    assert!(report.is_success(), "{report:?}");
    jar.assert(predicate::path::is_file());
    manifest.assert(predicate::str::contains("org.example.tools"));

    let installed = find(&engine, &target, "org.example.tools");
    engine.unconfigure(&installed, &target).unwrap();
    let removed = engine.remove_feature(&installed, &target).unwrap();
    assert_eq!(
        removed.outcome(&vid1("org.example.tools")).unwrap().status,
        UnitStatus::Removed
    );
    jar.assert(predicate::path::missing());
    manifest.assert(predicate::path::missing());
    root.child(".update/error_recovery.log").assert(predicate::path::missing());

    let again = engine
        .install_feature(&find(&engine, &source.url(), "org.example.tools"), &target, &InstallOptions::default())
        .unwrap();
    assert_eq!(
        again.outcome(&vid1("org.example.tools")).unwrap().status,
        UnitStatus::Installed
    );
    jar.assert(predicate::path::is_file());

    let actions: Vec<_> = engine
        .snapshots()
        .iter()
        .flat_map(|snapshot| snapshot.activities().iter().map(|a| a.action))
        .collect();
    assert!(actions.ends_with(&[
        ActivityAction::FeatureInstall,
        ActivityAction::Unconfigure,
        ActivityAction::FeatureRemove,
        ActivityAction::FeatureInstall,
    ]));
}
