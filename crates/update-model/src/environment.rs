//! Platform applicability of features and plugin entries.
//!
//! Manifests restrict entries with comma-separated allow-lists for four
//! dimensions: operating system, windowing system, architecture and locale.
//! A missing or empty list matches everything, as does a `*` token. An entry
//! applies when every dimension matches.
//!
//! Filtering never drops anything silently. [`filter_applicable`] returns a
//! [`FilterReport`] naming each excluded entry and the first dimension that
//! rejected it, and emits a debug event for it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The running platform, in manifest vocabulary (`linux`, `gtk`, `x86_64`, `en_US`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEnvironment {
    pub os: String,
    pub ws: String,
    pub arch: String,
    pub nl: String,
}

impl PlatformEnvironment {
    pub fn new(
        os: impl Into<String>,
        ws: impl Into<String>,
        arch: impl Into<String>,
        nl: impl Into<String>,
    ) -> Self {
        Self {
            os: os.into(),
            ws: ws.into(),
            arch: arch.into(),
            nl: nl.into(),
        }
    }

    /// Detect the environment of this process.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => "win32",
            "macos" => "macosx",
            other => other,
        };
        let ws = match std::env::consts::OS {
            "windows" => "win32",
            "macos" => "cocoa",
            "linux" | "freebsd" | "openbsd" | "netbsd" => "gtk",
            _ => "unknown",
        };
        let arch = match std::env::consts::ARCH {
            "x86" => "x86",
            other => other,
        };
        Self::new(os, ws, arch, detect_locale())
    }

    /// Apply per-dimension overrides from settings.
    pub fn with_overrides(mut self, overrides: &EnvironmentOverrides) -> Self {
        if let Some(os) = &overrides.os {
            self.os.clone_from(os);
        }
        if let Some(ws) = &overrides.ws {
            self.ws.clone_from(ws);
        }
        if let Some(arch) = &overrides.arch {
            self.arch.clone_from(arch);
        }
        if let Some(nl) = &overrides.nl {
            self.nl.clone_from(nl);
        }
        self
    }

    fn value(&self, dimension: EnvironmentDimension) -> &str {
        match dimension {
            EnvironmentDimension::Os => &self.os,
            EnvironmentDimension::Ws => &self.ws,
            EnvironmentDimension::Arch => &self.arch,
            EnvironmentDimension::Nl => &self.nl,
        }
    }
}

fn detect_locale() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty() && value != "C" && value != "POSIX")
        .map(|value| {
            let bare = value.split(['.', '@']).next().unwrap_or_default();
            bare.replace('-', "_")
        })
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "en_US".to_string())
}

/// Optional per-dimension overrides, read from settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentOverrides {
    pub os: Option<String>,
    pub ws: Option<String>,
    pub arch: Option<String>,
    pub nl: Option<String>,
}

/// Source of the current platform environment.
pub trait EnvironmentProvider: Send + Sync {
    fn environment(&self) -> PlatformEnvironment;
}

/// Provider backed by [`PlatformEnvironment::current`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl EnvironmentProvider for SystemEnvironment {
    fn environment(&self) -> PlatformEnvironment {
        PlatformEnvironment::current()
    }
}

impl EnvironmentProvider for PlatformEnvironment {
    fn environment(&self) -> PlatformEnvironment {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentDimension {
    Os,
    Ws,
    Arch,
    Nl,
}

impl EnvironmentDimension {
    pub const ALL: [Self; 4] = [Self::Os, Self::Ws, Self::Arch, Self::Nl];
}

impl fmt::Display for EnvironmentDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Os => "os",
            Self::Ws => "ws",
            Self::Arch => "arch",
            Self::Nl => "nl",
        })
    }
}

/// Allow-lists declared by a manifest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nl: Option<String>,
}

impl EnvironmentFilter {
    /// A filter that matches every platform.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_ws(mut self, ws: impl Into<String>) -> Self {
        self.ws = Some(ws.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_nl(mut self, nl: impl Into<String>) -> Self {
        self.nl = Some(nl.into());
        self
    }

    fn list(&self, dimension: EnvironmentDimension) -> Option<&str> {
        match dimension {
            EnvironmentDimension::Os => self.os.as_deref(),
            EnvironmentDimension::Ws => self.ws.as_deref(),
            EnvironmentDimension::Arch => self.arch.as_deref(),
            EnvironmentDimension::Nl => self.nl.as_deref(),
        }
    }

    /// First dimension that rejects `env`, if any.
    pub fn mismatch(&self, env: &PlatformEnvironment) -> Option<EnvironmentDimension> {
        EnvironmentDimension::ALL.into_iter().find(|&dimension| {
            let runtime = env.value(dimension);
            !dimension_matches(self.list(dimension), runtime, dimension)
        })
    }

    /// Whether every dimension admits `env`.
    pub fn applies(&self, env: &PlatformEnvironment) -> bool {
        self.mismatch(env).is_none()
    }

    pub fn is_unrestricted(&self) -> bool {
        EnvironmentDimension::ALL
            .into_iter()
            .all(|dimension| self.list(dimension).is_none_or(|list| list.trim().is_empty()))
    }
}

fn dimension_matches(list: Option<&str>, runtime: &str, dimension: EnvironmentDimension) -> bool {
    let Some(list) = list else {
        return true;
    };
    let mut tokens = list.split(',').map(str::trim).filter(|t| !t.is_empty()).peekable();
    if tokens.peek().is_none() {
        return true;
    }

    tokens.any(|token| {
        if token == "*" {
            return true;
        }
        match dimension {
            EnvironmentDimension::Nl => locale_matches(token, runtime),
            _ => token.eq_ignore_ascii_case(runtime),
        }
    })
}

// `en` admits `en_US`, and `en_US` admits a runtime of plain `en`.
fn locale_matches(token: &str, runtime: &str) -> bool {
    let token = token.to_ascii_lowercase().replace('-', "_");
    let runtime = runtime.to_ascii_lowercase().replace('-', "_");
    if token.is_empty() || runtime.is_empty() {
        return token == runtime;
    }
    token.starts_with(&runtime) || runtime.starts_with(&token)
}

/// Something that carries an [`EnvironmentFilter`].
pub trait Applicability {
    fn environment_filter(&self) -> &EnvironmentFilter;

    /// Human-readable name used in exclusion reports.
    fn describe(&self) -> String;
}

impl<T: Applicability + ?Sized> Applicability for std::sync::Arc<T> {
    fn environment_filter(&self) -> &EnvironmentFilter {
        (**self).environment_filter()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// One entry removed by [`filter_applicable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub entry: String,
    pub dimension: EnvironmentDimension,
    pub declared: String,
    pub runtime: String,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} excluded: {} '{}' does not admit '{}'",
            self.entry, self.dimension, self.declared, self.runtime
        )
    }
}

/// Everything a filtering pass excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub excluded: Vec<Exclusion>,
}

impl FilterReport {
    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }

    pub fn merge(&mut self, other: FilterReport) {
        self.excluded.extend(other.excluded);
    }
}

/// Keep the items that apply to `env`, reporting the rest.
pub fn filter_applicable<T, I>(items: I, env: &PlatformEnvironment) -> (Vec<T>, FilterReport)
where
    T: Applicability,
    I: IntoIterator<Item = T>,
{
    let mut kept = Vec::new();
    let mut report = FilterReport::default();

    for item in items {
        let filter = item.environment_filter();
        match filter.mismatch(env) {
            None => kept.push(item),
            Some(dimension) => {
                let exclusion = Exclusion {
                    entry: item.describe(),
                    dimension,
                    declared: filter.list(dimension).unwrap_or_default().to_string(),
                    runtime: env.value(dimension).to_string(),
                };
                tracing::debug!(
                    entry = %exclusion.entry,
                    dimension = %dimension,
                    declared = %exclusion.declared,
                    runtime = %exclusion.runtime,
                    "Entry excluded by environment filter"
                );
                report.excluded.push(exclusion);
            }
        }
    }

    (kept, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn linux() -> PlatformEnvironment {
        PlatformEnvironment::new("linux", "gtk", "x86_64", "en_US")
    }

    #[test]
    fn missing_list_matches_any_os() {
        let filter = EnvironmentFilter::any();
        assert!(filter.applies(&linux()));
        assert!(filter.applies(&PlatformEnvironment::new("macosx", "cocoa", "aarch64", "de")));
    }

    #[rstest]
    #[case("linux", true)]
    #[case("macosx", false)]
    #[case("win32", true)]
    fn os_allow_list(#[case] runtime_os: &str, #[case] expected: bool) {
        let filter = EnvironmentFilter::any().with_os("win32,linux");
        let env = PlatformEnvironment::new(runtime_os, "gtk", "x86_64", "en_US");
        assert_eq!(filter.applies(&env), expected);
    }

    #[rstest]
    #[case("", true)]
    #[case("*", true)]
    #[case(" LINUX ", true)]
    #[case("aix, hpux", false)]
    fn os_token_forms(#[case] list: &str, #[case] expected: bool) {
        let filter = EnvironmentFilter::any().with_os(list);
        assert_eq!(filter.applies(&linux()), expected);
    }

    #[rstest]
    #[case("en", "en_US", true)]
    #[case("en_US", "en", true)]
    #[case("EN_us", "en_US", true)]
    #[case("de", "en_US", false)]
    #[case("fr_FR,en", "en_GB", true)]
    fn locale_prefix_matching(#[case] list: &str, #[case] runtime: &str, #[case] expected: bool) {
        let filter = EnvironmentFilter::any().with_nl(list);
        let env = PlatformEnvironment::new("linux", "gtk", "x86_64", runtime);
        assert_eq!(filter.applies(&env), expected);
    }

    #[test]
    fn result_is_conjunction_of_dimensions() {
        let filter = EnvironmentFilter::any().with_os("linux").with_arch("ppc64");
        assert_eq!(filter.mismatch(&linux()), Some(EnvironmentDimension::Arch));
    }

    #[test]
    fn overrides_replace_detected_values() {
        let env = linux().with_overrides(&EnvironmentOverrides {
            os: Some("win32".into()),
            ..Default::default()
        });
        assert_eq!(env.os, "win32");
        assert_eq!(env.ws, "gtk");
    }

    struct Named(&'static str, EnvironmentFilter);

    impl Applicability for Named {
        fn environment_filter(&self) -> &EnvironmentFilter {
            &self.1
        }

        fn describe(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn filtering_reports_exclusions() {
        let items = vec![
            Named("everywhere", EnvironmentFilter::any()),
            Named("windows-only", EnvironmentFilter::any().with_os("win32")),
            Named("gtk", EnvironmentFilter::any().with_ws("gtk,motif")),
        ];

        let (kept, report) = filter_applicable(items, &linux());

        let kept: Vec<_> = kept.iter().map(|n| n.0).collect();
        assert_eq!(kept, vec!["everywhere", "gtk"]);
        assert_eq!(report.excluded.len(), 1);
        let exclusion = &report.excluded[0];
        assert_eq!(exclusion.entry, "windows-only");
        assert_eq!(exclusion.dimension, EnvironmentDimension::Os);
        assert_eq!(exclusion.declared, "win32");
        assert_eq!(exclusion.runtime, "linux");
    }
}
