//! Sites served over HTTP(S).
//!
//! A remote site is read-only: its catalog (`site.toml`) and feature
//! manifests are fetched on demand, and its archives are transferred into
//! the installation before being stored.

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use update_model::manifest::{SITE_MANIFEST, parse_feature_manifest, parse_site_manifest};
use update_model::{ContentReference, Feature, FeatureResolver, Site, SiteFactory, SiteKind};
use url::Url;

use crate::download::ContentFetcher;

/// Site factory for `http` and `https` URLs.
pub struct HttpSiteFactory {
    fetcher: Arc<dyn ContentFetcher>,
}

impl fmt::Debug for HttpSiteFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSiteFactory").finish_non_exhaustive()
    }
}

impl HttpSiteFactory {
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self { fetcher }
    }
}

impl SiteFactory for HttpSiteFactory {
    fn create(&self, url: &Url) -> update_model::Result<Site> {
        let resolver = Arc::new(RemoteFeatureResolver {
            fetcher: Arc::clone(&self.fetcher),
        });
        let builder = Site::builder(url.clone(), SiteKind::Remote, resolver);
        let catalog_url = builder.url().join(SITE_MANIFEST).map_err(|source| update_model::Error::InvalidUrl {
            url: SITE_MANIFEST.to_string(),
            source,
        })?;

        let content = fetch_text(self.fetcher.as_ref(), &catalog_url)?;
        let manifest = parse_site_manifest(&content, catalog_url.as_str())?;
        let site = manifest.populate(builder)?.build();
        tracing::info!(site = %site.url(), features = site.feature_references().len(), "Resolved remote site");
        Ok(site)
    }
}

/// Fetches feature manifests from a remote site.
struct RemoteFeatureResolver {
    fetcher: Arc<dyn ContentFetcher>,
}

impl FeatureResolver for RemoteFeatureResolver {
    fn resolve(&self, manifest_url: &Url) -> update_model::Result<Feature> {
        let content = fetch_text(self.fetcher.as_ref(), manifest_url)?;
        parse_feature_manifest(&content, manifest_url.as_str())
    }
}

fn fetch_text(fetcher: &dyn ContentFetcher, url: &Url) -> update_model::Result<String> {
    let unreachable = |message: String| update_model::Error::Unreachable {
        url: url.to_string(),
        message,
    };
    let reference = ContentReference::remote(url.as_str(), url.clone());
    let mut reader = fetcher.open(&reference).map_err(|e| unreachable(e.to_string()))?;
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| unreachable(e.to_string()))?;
    tracing::debug!(url = %url, bytes = content.len(), "Fetched remote manifest");
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    struct MapFetcher(HashMap<String, String>);

    impl ContentFetcher for MapFetcher {
        fn open(&self, reference: &ContentReference) -> crate::Result<Box<dyn Read + Send>> {
            match self.0.get(reference.identifier()) {
                Some(body) => Ok(Box::new(Cursor::new(body.clone().into_bytes()))),
                None => Err(crate::Error::download(
                    reference.identifier(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "404"),
                )),
            }
        }
    }

    #[test]
    fn resolves_catalog_and_features() {
        let mut pages = HashMap::new();
        pages.insert(
            "https://updates.example.org/site/site.toml".to_string(),
            r#"
[site]
label = "Example"

[[feature]]
url = "features/f_1.0.0/feature.toml"
id = "f"
version = "1.0.0"
"#
            .to_string(),
        );
        pages.insert(
            "https://updates.example.org/site/features/f_1.0.0/feature.toml".to_string(),
            r#"
[feature]
id = "f"
version = "1.0.0"
"#
            .to_string(),
        );
        let factory = HttpSiteFactory::new(Arc::new(MapFetcher(pages)));

        let site = factory
            .create(&Url::parse("https://updates.example.org/site").unwrap())
            .unwrap();

        assert!(!site.is_storable());
        let references = site.feature_references();
        assert_eq!(references.len(), 1);
        let feature = references[0].feature().unwrap();
        assert_eq!(feature.identifier().to_string(), "f_1.0.0");
    }

    #[test]
    fn missing_catalog_is_unreachable() {
        let factory = HttpSiteFactory::new(Arc::new(MapFetcher(HashMap::new())));
        let err = factory
            .create(&Url::parse("https://updates.example.org/none/").unwrap())
            .unwrap_err();
        assert!(matches!(err, update_model::Error::Unreachable { .. }));
    }
}
