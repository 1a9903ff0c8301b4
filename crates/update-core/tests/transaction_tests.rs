//! Tests for install and remove transactions against local sites

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use url::Url;

use update_core::recovery::{LogEntryKind, parse_log};
use update_core::{
    ContentConsumer, Error, InstallTransaction, RemoveTransaction, TransactionState, UpdateContext,
    UpdateSettings,
};
use update_model::{Feature, FileSiteFactory, PluginEntry, Site, SiteFactory, Version};
use update_test_utils::{SiteFixture, read_tar, vid, vid1, write_tar};

fn context(root: &Path) -> UpdateContext {
    UpdateContext::builder(root)
        .settings(UpdateSettings::default())
        .build()
        .unwrap()
}

fn local_site(root: &Path) -> Arc<Site> {
    fs::create_dir_all(root).unwrap();
    let url = Url::from_directory_path(root).unwrap();
    Arc::new(FileSiteFactory.create(&url).unwrap())
}

fn feature_with(id: &str, plugins: &[&str]) -> Feature {
    let mut builder = Feature::builder(vid1(id));
    for plugin in plugins {
        builder = builder.plugin(PluginEntry::new(vid1(plugin)));
    }
    builder.build().unwrap()
}

fn log_kinds(ctx: &UpdateContext) -> Vec<LogEntryKind> {
    let content = fs::read_to_string(ctx.log().path()).unwrap();
    parse_log(&content).into_iter().map(|r| r.kind).collect()
}

struct Setup {
    install: TempDir,
    source: SiteFixture,
    feature: Arc<Feature>,
}

fn setup(plugins: &[&str]) -> Setup {
    let mut source = SiteFixture::new();
    let feature = feature_with("org.example.tools", plugins);
    source.add_feature(&feature);
    Setup {
        install: TempDir::new().unwrap(),
        source,
        feature: Arc::new(feature),
    }
}

mod install_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn close_commits_files_and_registers_units() {
        let s = setup(&["org.example.a", "org.example.b"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), Arc::clone(&target)).unwrap();
        for entry in s.feature.plugins() {
            let reference = source.plugin_content(entry).unwrap();
            tx.store_plugin(entry, &reference).unwrap();
        }
        let report = tx.close().unwrap();

        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(report.plugins.len(), 2);
        assert!(!report.recovery_inconsistent);
        let installed = s.install.path().join("plugins/org.example.a_1.0.0.jar");
        assert!(installed.is_file());
        assert!(!s.install.path().join("plugins/org.example.a_1.0.0.jar.tmp").exists());
        assert!(
            s.install
                .path()
                .join("features/org.example.tools_1.0.0/feature.toml")
                .is_file()
        );
        assert_eq!(read_tar(&installed), vec![("plugin.toml".to_string(), "org.example.a_1.0.0".to_string())]);

        assert!(target.has_plugin(&vid1("org.example.a")));
        assert!(target.find_feature(&vid1("org.example.tools")).is_some());

        let kinds = log_kinds(&ctx);
        assert_eq!(kinds.last(), Some(&LogEntryKind::EndInstall));
        let first_rename = kinds.iter().position(|k| *k == LogEntryKind::Rename).unwrap();
        let last_stage = kinds.iter().rposition(|k| *k == LogEntryKind::BundleJarEntry).unwrap();
        assert!(last_stage < first_rename, "every stage is logged before any rename: {kinds:?}");
    }

    #[test]
    fn abort_after_partial_store_leaves_no_final_files() {
        let s = setup(&["org.example.a", "org.example.b"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), Arc::clone(&target)).unwrap();
        let first = &s.feature.plugins()[0];
        tx.store_plugin(first, &source.plugin_content(first).unwrap()).unwrap();
        let report = tx.abort();

        assert_eq!(tx.state(), TransactionState::Aborted);
        assert!(!report.recovery_inconsistent);
        let plugins = s.install.path().join("plugins");
        assert!(!plugins.join("org.example.a_1.0.0.jar").exists());
        assert!(!plugins.join("org.example.a_1.0.0.jar.tmp").exists());
        assert!(!target.has_plugin(&vid1("org.example.a")));

        let kinds = log_kinds(&ctx);
        assert_eq!(kinds, vec![LogEntryKind::BundleJarEntry, LogEntryKind::Delete]);
    }

    #[test]
    fn failed_rename_fails_close_and_registers_nothing() {
        let s = setup(&["org.example.a", "org.example.b"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), Arc::clone(&target)).unwrap();
        for entry in s.feature.plugins() {
            tx.store_plugin(entry, &source.plugin_content(entry).unwrap()).unwrap();
        }
        let plugins = s.install.path().join("plugins");
        fs::remove_file(plugins.join("org.example.b_1.0.0.jar.tmp")).unwrap();

        assert!(tx.close().is_err());
        assert!(!target.has_plugin(&vid1("org.example.a")));
        assert!(!target.has_plugin(&vid1("org.example.b")));
        assert!(target.find_feature(&vid1("org.example.tools")).is_none());
        assert!(!log_kinds(&ctx).contains(&LogEntryKind::EndInstall));

        tx.abort();
        assert_eq!(tx.state(), TransactionState::Aborted);
        let leftovers: Vec<_> = fs::read_dir(&plugins)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn concurrent_transactions_log_under_their_own_tags() {
        let s = setup(&["org.example.a"]);
        let other = feature_with("org.example.other", &["org.example.c"]);
        let mut source_fixture = s.source;
        source_fixture.add_feature(&other);
        let ctx = context(s.install.path());
        let source = local_site(source_fixture.root());
        let target = local_site(s.install.path());

        let mut first = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), Arc::clone(&target)).unwrap();
        let mut second = InstallTransaction::begin(&ctx, Arc::new(other.clone()), Arc::clone(&target)).unwrap();
        assert_eq!(ctx.log().open_transactions(), 2);
        let a = &s.feature.plugins()[0];
        let c = &other.plugins()[0];
        first.store_plugin(a, &source.plugin_content(a).unwrap()).unwrap();
        second.store_plugin(c, &source.plugin_content(c).unwrap()).unwrap();
        second.close().unwrap();

        let content = fs::read_to_string(ctx.log().path()).unwrap();
        let records = parse_log(&content);
        let tags: std::collections::BTreeSet<_> = records.iter().map(|r| r.transaction).collect();
        assert_eq!(tags.len(), 2);
        let report = update_core::RecoveryReport::from_records(records);
        assert_eq!(report.incomplete_transactions, 1);

        drop(first);
        drop(second);
        assert_eq!(ctx.log().open_transactions(), 0);
    }

    #[test]
    fn second_close_and_abort_are_reported_not_repeated() {
        let s = setup(&["org.example.a"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), target).unwrap();
        let entry = &s.feature.plugins()[0];
        tx.store_plugin(entry, &source.plugin_content(entry).unwrap()).unwrap();
        tx.close().unwrap();

        let again = tx.close().unwrap();
        assert!(again.repeated);
        assert_eq!(again.warnings.len(), 1);

        let abort = tx.abort();
        assert!(abort.repeated);
        assert!(abort.removed.is_empty());
        assert!(s.install.path().join("plugins/org.example.a_1.0.0.jar").is_file());
    }

    #[test]
    fn store_after_close_is_rejected() {
        let s = setup(&["org.example.a"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), target).unwrap();
        tx.close().unwrap();

        let entry = &s.feature.plugins()[0];
        let err = tx.store_plugin(entry, &source.plugin_content(entry).unwrap()).unwrap_err();
        assert!(matches!(err, Error::ConsumerClosed { .. }), "got {err:?}");
    }

    #[test]
    fn existing_final_file_is_never_overwritten() {
        let s = setup(&["org.example.a"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let occupied = s.install.path().join("plugins/org.example.a_1.0.0.jar");
        fs::create_dir_all(occupied.parent().unwrap()).unwrap();
        fs::write(&occupied, "local").unwrap();
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), target).unwrap();
        let entry = &s.feature.plugins()[0];
        let err = tx.store_plugin(entry, &source.plugin_content(entry).unwrap()).unwrap_err();

        assert!(matches!(err, Error::AlreadyExists { .. }), "got {err:?}");
        assert_eq!(fs::read_to_string(&occupied).unwrap(), "local");
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let s = setup(&["org.example.a"]);
        let ctx = context(s.install.path());
        let target = local_site(s.install.path());

        let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), target).unwrap();
        let stranger = PluginEntry::new(vid1("org.example.stranger"));
        let err = tx.plugin_consumer(&stranger).unwrap_err();
        assert!(matches!(err, Error::UnknownPlugin { .. }), "got {err:?}");
    }

    #[test]
    fn dropping_an_open_transaction_aborts_it() {
        let s = setup(&["org.example.a"]);
        let ctx = context(s.install.path());
        let source = local_site(s.source.root());
        let target = local_site(s.install.path());

        {
            let mut tx = InstallTransaction::begin(&ctx, Arc::clone(&s.feature), target).unwrap();
            let entry = &s.feature.plugins()[0];
            tx.store_plugin(entry, &source.plugin_content(entry).unwrap()).unwrap();
        }

        assert!(!s.install.path().join("plugins/org.example.a_1.0.0.jar.tmp").exists());
        assert_eq!(ctx.locks().outstanding(), 0);
    }

    #[test]
    fn unpack_plugin_installs_a_directory() {
        let mut source = SiteFixture::new();
        let entry = PluginEntry::new(vid1("org.example.res")).with_unpack(true);
        let feature = Feature::builder(vid1("org.example.tools"))
            .plugin(entry.clone())
            .build()
            .unwrap();
        source.add_feature(&feature);
        source.add_plugin_archive(&entry, &[("plugin.toml", "res"), ("icons/a.png", "png")]);
        let install = TempDir::new().unwrap();
        let ctx = context(install.path());
        let source_site = local_site(source.root());

        let mut tx = InstallTransaction::begin(&ctx, Arc::new(feature), local_site(install.path())).unwrap();
        tx.store_plugin(&entry, &source_site.plugin_content(&entry).unwrap()).unwrap();
        tx.close().unwrap();

        let dir = install.path().join("plugins/org.example.res_1.0.0");
        assert!(dir.is_dir());
        assert_eq!(fs::read_to_string(dir.join("icons/a.png")).unwrap(), "png");
        let leftovers: Vec<_> = fs::read_dir(install.path().join("plugins"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn delta_plugin_overlays_the_installed_base() {
        let install = TempDir::new().unwrap();
        write_tar(
            &install.path().join("plugins/org.example.a_1.0.0.jar"),
            &[("plugin.toml", "1.0"), ("lib/old.class", "old"), ("lib/keep.class", "keep")],
        );

        let mut source = SiteFixture::new();
        let entry = PluginEntry::new(vid("org.example.a", "1.1.0"))
            .with_delta_base(Some(Version::new(1, 0, 0)));
        let feature = Feature::builder(vid("org.example.tools", "1.1.0"))
            .plugin(entry.clone())
            .build()
            .unwrap();
        source.add_feature(&feature);
        source.add_plugin_archive(&entry, &[("plugin.toml", "1.1"), ("lib/old.class", "new")]);

        let ctx = context(install.path());
        let source_site = local_site(source.root());
        let mut tx = InstallTransaction::begin(&ctx, Arc::new(feature), local_site(install.path())).unwrap();
        tx.store_plugin(&entry, &source_site.plugin_content(&entry).unwrap()).unwrap();
        tx.close().unwrap();

        let merged = read_tar(&install.path().join("plugins/org.example.a_1.1.0.jar"));
        assert_eq!(
            merged,
            vec![
                ("plugin.toml".to_string(), "1.1".to_string()),
                ("lib/old.class".to_string(), "new".to_string()),
                ("lib/keep.class".to_string(), "keep".to_string()),
            ]
        );
    }
}

mod remove_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn install(ctx: &UpdateContext, source: &Site, target: &Arc<Site>, feature: &Arc<Feature>) {
        let mut tx = InstallTransaction::begin(ctx, Arc::clone(feature), Arc::clone(target)).unwrap();
        for entry in feature.plugins() {
            if !target.has_plugin(entry.identifier()) {
                tx.store_plugin(entry, &source.plugin_content(entry).unwrap()).unwrap();
            }
        }
        tx.close().unwrap();
    }

    #[test]
    fn shared_plugins_survive_removal() {
        let mut fixture = SiteFixture::new();
        let first = Arc::new(feature_with("org.example.first", &["org.example.shared", "org.example.own"]));
        let second = Arc::new(feature_with("org.example.second", &["org.example.shared"]));
        fixture.add_feature(&first).add_feature(&second);

        let root = TempDir::new().unwrap();
        let ctx = context(root.path());
        let source = local_site(fixture.root());
        let target = local_site(root.path());
        install(&ctx, &source, &target, &first);
        install(&ctx, &source, &target, &second);

        let mut tx = RemoveTransaction::begin(&ctx, Arc::clone(&first), Arc::clone(&target)).unwrap();
        assert_eq!(tx.shared_plugins(), &[vid1("org.example.shared")]);
        let report = tx.close().unwrap();

        let plugins = root.path().join("plugins");
        assert!(plugins.join("org.example.shared_1.0.0.jar").is_file());
        assert!(!plugins.join("org.example.own_1.0.0.jar").exists());
        assert!(!root.path().join("features/org.example.first_1.0.0").exists());
        assert_eq!(report.plugins, vec![vid1("org.example.own")]);
        assert!(target.find_feature(&vid1("org.example.first")).is_none());
        assert!(target.find_feature(&vid1("org.example.second")).is_some());
        assert_eq!(log_kinds(&ctx).last(), Some(&LogEntryKind::EndRemove));
    }

    #[test]
    fn abort_before_close_touches_nothing() {
        let mut fixture = SiteFixture::new();
        let feature = Arc::new(feature_with("org.example.first", &["org.example.own"]));
        fixture.add_feature(&feature);
        let root = TempDir::new().unwrap();
        let ctx = context(root.path());
        let target = local_site(root.path());
        install(&ctx, &local_site(fixture.root()), &target, &feature);

        let mut tx = RemoveTransaction::begin(&ctx, Arc::clone(&feature), target).unwrap();
        let report = tx.abort();

        assert!(report.warnings.is_empty());
        assert!(root.path().join("plugins/org.example.own_1.0.0.jar").is_file());
    }
}

mod recovery_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn startup_sweep_rolls_back_an_interrupted_install() {
        let root = TempDir::new().unwrap();
        let plugins = root.path().join("plugins");
        fs::create_dir_all(&plugins).unwrap();
        let staged = plugins.join("org.example.a_1.0.0.jar.tmp");
        fs::write(&staged, "partial").unwrap();
        let renamed_temp = plugins.join("org.example.b_1.0.0.jar.tmp");
        let renamed_final = plugins.join("org.example.b_1.0.0.jar");
        fs::write(&renamed_final, "complete").unwrap();

        let state_dir = root.path().join(".update");
        fs::create_dir_all(&state_dir).unwrap();
        let log_path = state_dir.join(UpdateSettings::default().recovery_log_name);
        fs::write(
            &log_path,
            format!(
                "LogEntry.0=BUNDLE_JAR_ENTRY {}\nLogEntry.1=BUNDLE_JAR_ENTRY {}\nLogEntry.2=RENAME {}\n",
                staged.display(),
                renamed_temp.display(),
                renamed_temp.display()
            ),
        )
        .unwrap();

        let ctx = context(root.path());
        let report = ctx.startup_recovery();

        assert_eq!(report.incomplete_transactions, 1);
        assert!(!staged.exists());
        assert!(!renamed_final.exists());
        assert!(report.failures.is_empty());
        assert!(!log_path.exists());
    }

    #[test]
    fn completed_log_is_discarded_without_touching_files() {
        let root = TempDir::new().unwrap();
        let installed = root.path().join("plugins/org.example.a_1.0.0.jar");
        fs::create_dir_all(installed.parent().unwrap()).unwrap();
        fs::write(&installed, "jar").unwrap();
        let temp = root.path().join("plugins/org.example.a_1.0.0.jar.tmp");

        let state_dir = root.path().join(".update");
        fs::create_dir_all(&state_dir).unwrap();
        let log_path = state_dir.join(UpdateSettings::default().recovery_log_name);
        fs::write(
            &log_path,
            format!(
                "LogEntry.0=BUNDLE_JAR_ENTRY {t}\nLogEntry.1=RENAME {t}\nLogEntry.2=PLUGIN {i}\nLogEntry.3=END_INSTALL {i}\neof=eof\n",
                t = temp.display(),
                i = installed.display()
            ),
        )
        .unwrap();

        let ctx = context(root.path());

        assert_eq!(ctx.startup_recovery().incomplete_transactions, 0);
        assert!(installed.is_file());
        assert!(!log_path.exists());
    }
}
