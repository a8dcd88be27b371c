//! Install targets for the sandbox.
//!
//! A target is either a bare package name (resolved in the configured
//! packages directory) or a locator URL pointing at a module bundle.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use url::Url;

/// Suffixes that mark a target as a locator even when it is not a full URL
const LOCATOR_SUFFIXES: &[&str] = &[".whl", ".js", ".mjs", ".tar.gz", ".zip"];

/// A single install target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSpec {
    /// Bare name, e.g. `leaflet`
    Name(String),
    /// Locator with the short name derived from its final path component
    Locator { url: String, name: String },
}

impl PackageSpec {
    pub fn parse(target: &str) -> Self {
        let target = target.trim();
        if is_locator(target) {
            PackageSpec::Locator {
                url: target.to_string(),
                name: short_name(target),
            }
        } else {
            PackageSpec::Name(target.to_string())
        }
    }

    /// Short name used in status messages and the sandbox package registry
    pub fn name(&self) -> &str {
        match self {
            PackageSpec::Name(name) => name,
            PackageSpec::Locator { name, .. } => name,
        }
    }

    /// Module specifier handed to the sandbox's dynamic import
    pub fn specifier(&self) -> &str {
        match self {
            PackageSpec::Name(name) => name,
            PackageSpec::Locator { url, .. } => url,
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.specifier())
    }
}

impl Serialize for PackageSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.specifier())
    }
}

impl<'de> Deserialize<'de> for PackageSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let target = String::deserialize(deserializer)?;
        Ok(PackageSpec::parse(&target))
    }
}

fn is_locator(target: &str) -> bool {
    let path = strip_query_and_fragment(target);
    if LOCATOR_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
        return true;
    }
    matches!(
        Url::parse(target).map(|u| u.scheme().to_string()).as_deref(),
        Ok("http") | Ok("https") | Ok("file")
    )
}

fn strip_query_and_fragment(target: &str) -> &str {
    let end = target.find(['?', '#']).unwrap_or(target.len());
    &target[..end]
}

/// `https://cdn.x/dist/leaflet-1.9.4-esm.js` -> `leaflet`
fn short_name(locator: &str) -> String {
    let path = strip_query_and_fragment(locator).trim_end_matches('/');
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split('-').next().unwrap_or(file).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name() {
        let spec = PackageSpec::parse("awesome_panel");
        assert_eq!(spec, PackageSpec::Name("awesome_panel".into()));
        assert_eq!(spec.name(), "awesome_panel");
        assert_eq!(spec.specifier(), "awesome_panel");
    }

    #[test]
    fn test_hyphenated_name_stays_whole() {
        let spec = PackageSpec::parse("awesome-panel-extensions");
        assert_eq!(spec.name(), "awesome-panel-extensions");
    }

    #[test]
    fn test_wheel_locator() {
        let spec = PackageSpec::parse(
            "https://cdn.holoviz.org/panel/0.14.4/dist/wheels/bokeh-2.4.3-py3-none-any.whl",
        );
        assert_eq!(spec.name(), "bokeh");
        assert!(matches!(spec, PackageSpec::Locator { .. }));
    }

    #[test]
    fn test_module_locator_with_integrity_pin() {
        let spec = PackageSpec::parse("https://cdn.example.com/leaflet-1.9.4-esm.js#sha256=abcd");
        assert_eq!(spec.name(), "leaflet");
        assert_eq!(
            spec.specifier(),
            "https://cdn.example.com/leaflet-1.9.4-esm.js#sha256=abcd"
        );
    }

    #[test]
    fn test_url_with_unknown_suffix_is_locator() {
        let spec = PackageSpec::parse("http://x/pkgB-1.0-whatever.ext");
        assert_eq!(spec.name(), "pkgB");
    }

    #[test]
    fn test_relative_module_path_is_locator() {
        let spec = PackageSpec::parse("vendor/markers-0.2.mjs");
        assert_eq!(spec.name(), "markers");
    }

    #[test]
    fn test_deserialize_list_keeps_order() {
        let specs: Vec<PackageSpec> =
            serde_json::from_str(r#"["pkgA", "http://x/pkgB-1.0-whatever.ext", "pkgC"]"#).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["pkgA", "pkgB", "pkgC"]);
    }
}
