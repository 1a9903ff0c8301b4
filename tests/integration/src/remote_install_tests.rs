//! Installs from an HTTP update site, served from memory.
//!
//! The fetcher stands in for the network: the catalog, feature manifests
//! and archives are keyed by URL, and every request is recorded.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use url::Url;

use update_core::{
    CancellationToken, ContentFetcher, DefaultFetcher, DownloadMonitor, Error, InstallOptions,
    UnitStatus, UpdateContext, UpdateEngine, UpdateSettings,
};
use update_fs::checksum::compute_bytes_checksum;
use update_model::manifest::{
    ArchiveSection, SiteFeatureSection, SiteManifest, render_feature_manifest, render_site_manifest,
};
use update_model::{ContentReference, ContentSource, Feature, PlatformEnvironment, PluginEntry};
use update_test_utils::{init_tracing, read_tar, vid1, write_tar};

const SITE: &str = "https://updates.example.org/site/";
const MIRROR: &str = "https://mirror.example.org/net.jar";

struct MapFetcher {
    pages: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
    local: DefaultFetcher,
}

impl MapFetcher {
    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl ContentFetcher for MapFetcher {
    fn open(&self, reference: &ContentReference) -> update_core::Result<Box<dyn Read + Send>> {
        let ContentSource::Remote(url) = reference.source() else {
            return self.local.open(reference);
        };
        self.requests.lock().unwrap().push(url.to_string());
        match self.pages.get(url.as_str()) {
            Some(body) => Ok(Box::new(Cursor::new(body.clone()))),
            None => Err(Error::download(
                reference.identifier(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "404 Not Found"),
            )),
        }
    }
}

fn jar_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plugin.jar");
    write_tar(&path, entries);
    fs::read(&path).unwrap()
}

fn net_feature() -> Feature {
    Feature::builder(vid1("org.example.net"))
        .plugin(PluginEntry::new(vid1("org.example.net")))
        .plugin(PluginEntry::new(vid1("org.example.net.ui")))
        .build()
        .unwrap()
}

/// A remote site publishing `org.example.net`. Its core plugin is served
/// from a mirror; `declared_checksum` overrides the checksum the catalog
/// declares for it.
fn remote_site(declared_checksum: Option<String>) -> MapFetcher {
    let feature = net_feature();
    let core_jar = jar_bytes(&[("plugin.toml", "org.example.net_1.0.0")]);
    let ui_jar = jar_bytes(&[("plugin.toml", "org.example.net.ui_1.0.0")]);

    let catalog = SiteManifest {
        features: vec![SiteFeatureSection {
            url: "features/org.example.net_1.0.0/feature.toml".to_string(),
            id: Some("org.example.net".to_string()),
            version: Some("1.0.0".to_string()),
            categories: Vec::new(),
            feature_type: None,
            environment: Default::default(),
        }],
        archives: vec![ArchiveSection {
            path: "plugins/org.example.net_1.0.0.jar".to_string(),
            url: MIRROR.to_string(),
            checksum: Some(declared_checksum.unwrap_or_else(|| compute_bytes_checksum(&core_jar))),
        }],
        ..SiteManifest::default()
    };

    let mut pages = HashMap::new();
    pages.insert(
        format!("{SITE}site.toml"),
        render_site_manifest(&catalog).unwrap().into_bytes(),
    );
    pages.insert(
        format!("{SITE}features/org.example.net_1.0.0/feature.toml"),
        render_feature_manifest(&feature).unwrap().into_bytes(),
    );
    pages.insert(MIRROR.to_string(), core_jar);
    pages.insert(format!("{SITE}plugins/org.example.net.ui_1.0.0.jar"), ui_jar);

    MapFetcher {
        pages,
        requests: Mutex::new(Vec::new()),
        local: DefaultFetcher::new(),
    }
}

fn engine(root: &Path, fetcher: Arc<MapFetcher>) -> UpdateEngine {
    init_tracing();
    let ctx = UpdateContext::builder(root)
        .settings(UpdateSettings::default())
        .environment(Arc::new(PlatformEnvironment::new("linux", "gtk", "x86_64", "en_US")))
        .fetcher(fetcher)
        .build()
        .unwrap();
    UpdateEngine::new(ctx).unwrap()
}

fn install_root_url(root: &Path) -> Url {
    Url::from_directory_path(root).unwrap()
}

fn files_under(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn installs_from_remote_site_through_the_download_directory() {
    let root = TempDir::new().unwrap();
    let fetcher = Arc::new(remote_site(None));
    let engine = engine(root.path(), Arc::clone(&fetcher));

    let site = engine.resolve(&Url::parse(SITE).unwrap()).unwrap();
    assert!(!site.is_storable());
    let reference = site.find_feature(&vid1("org.example.net")).unwrap();

    let monitor = Arc::new(DownloadMonitor::new());
    let options = InstallOptions::default().with_monitor(Arc::clone(&monitor));
    let report = engine
        .install_feature(&reference, &install_root_url(root.path()), &options)
        .unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(
        report.outcome(&vid1("org.example.net")).unwrap().status,
        UnitStatus::Installed
    );

    let core = root.path().join("plugins/org.example.net_1.0.0.jar");
    let ui = root.path().join("plugins/org.example.net.ui_1.0.0.jar");
    assert_eq!(
        read_tar(&core),
        vec![("plugin.toml".to_string(), "org.example.net_1.0.0".to_string())]
    );
    assert!(ui.is_file());
    assert!(root.path().join("features/org.example.net_1.0.0/feature.toml").is_file());
    assert_eq!(files_under(&root.path().join(".update/downloads")), Vec::<String>::new());

    let requests = fetcher.requests();
    assert!(requests.contains(&MIRROR.to_string()), "{requests:?}");
    assert!(requests.contains(&format!("{SITE}plugins/org.example.net.ui_1.0.0.jar")));
    assert!(monitor.snapshot().copied > 0);

    let config = engine.current_configuration();
    let binding = config.site(&install_root_url(root.path())).unwrap();
    assert!(binding.is_configured(&vid1("org.example.net")));
}

#[test]
fn checksum_mismatch_fails_the_unit_and_leaves_nothing_behind() {
    let root = TempDir::new().unwrap();
    let wrong = compute_bytes_checksum(b"something else entirely");
    let engine = engine(root.path(), Arc::new(remote_site(Some(wrong))));
    let reference = engine
        .resolve(&Url::parse(SITE).unwrap())
        .unwrap()
        .find_feature(&vid1("org.example.net"))
        .unwrap();

    let report = engine
        .install_feature(&reference, &install_root_url(root.path()), &InstallOptions::default())
        .unwrap();

    assert!(!report.is_success());
    assert!(matches!(
        report.outcome(&vid1("org.example.net")).unwrap().status,
        UnitStatus::Failed { .. }
    ));
    assert_eq!(files_under(&root.path().join("plugins")), Vec::<String>::new());
    assert_eq!(files_under(&root.path().join(".update/downloads")), Vec::<String>::new());
    assert!(!root.path().join(".update/error_recovery.log").exists());

    let config = engine.current_configuration();
    let binding = config.site(&install_root_url(root.path())).unwrap();
    assert!(!binding.is_configured(&vid1("org.example.net")));
}

#[test]
fn unreachable_site_is_reported_as_a_model_error() {
    let root = TempDir::new().unwrap();
    let engine = engine(root.path(), Arc::new(remote_site(None)));

    let err = engine
        .resolve(&Url::parse("https://updates.example.org/missing/").unwrap())
        .unwrap_err();

    assert!(
        matches!(err, Error::Model(update_model::Error::Unreachable { .. })),
        "{err:?}"
    );
}

#[test]
fn cancelled_install_fails_without_partial_files() {
    let root = TempDir::new().unwrap();
    let engine = engine(root.path(), Arc::new(remote_site(None)));
    let reference = engine
        .resolve(&Url::parse(SITE).unwrap())
        .unwrap()
        .find_feature(&vid1("org.example.net"))
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = engine
        .install_feature(
            &reference,
            &install_root_url(root.path()),
            &InstallOptions::default().with_cancellation(cancel),
        )
        .unwrap();

    assert!(matches!(
        report.outcome(&vid1("org.example.net")).unwrap().status,
        UnitStatus::Failed { .. }
    ));
    assert_eq!(files_under(&root.path().join("plugins")), Vec::<String>::new());
    assert!(!root.path().join("features/org.example.net_1.0.0").exists());
}
