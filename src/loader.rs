//! Sandboxed module loader for package installs.
//!
//! Bare package names resolve inside the packages directory, remote locators
//! are fetched only from allowlisted origins, and only .js/.mjs modules load.

use crate::fetch::{fetch_module_source, FetchConfig};
use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::path::{Path, PathBuf};

/// A module loader that restricts imports to one directory plus allowlisted origins.
///
/// Security guarantees:
/// - Remote URLs only from `FetchConfig::allowed_origins`
/// - No filesystem escape (path traversal blocked via canonicalization)
/// - Only .js and .mjs files allowed
/// - `data:` and `blob:` specifiers rejected
pub struct SandboxedLoader {
    packages_dir: Option<PathBuf>,
    fetch: FetchConfig,
}

impl SandboxedLoader {
    /// Create a loader. `packages_dir`, when given, must be an existing directory.
    pub fn new(packages_dir: Option<&Path>, fetch: FetchConfig) -> Result<Self, Error> {
        let packages_dir = match packages_dir {
            Some(dir) => {
                let canonical = dir
                    .canonicalize()
                    .map_err(|e| anyhow!("Failed to canonicalize packages_dir: {}", e))?;
                if !canonical.is_dir() {
                    return Err(anyhow!("packages_dir must be a directory"));
                }
                Some(canonical)
            }
            None => None,
        };

        Ok(Self {
            packages_dir,
            fetch,
        })
    }

    fn packages_dir(&self) -> Result<&Path, Error> {
        self.packages_dir
            .as_deref()
            .ok_or_else(|| anyhow!("No packages directory configured"))
    }

    /// Check if a path is within the packages directory.
    /// Uses canonicalization to resolve symlinks and prevent traversal.
    fn is_path_allowed(&self, path: &Path) -> bool {
        let Some(dir) = self.packages_dir.as_deref() else {
            return false;
        };
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(dir),
            Err(_) => false,
        }
    }

    /// Validate file extension is allowed (.js or .mjs only)
    fn is_extension_allowed(path: &str) -> bool {
        path.ends_with(".js") || path.ends_with(".mjs")
    }

    /// `leaflet` -> `<dir>/leaflet.js`, `<dir>/leaflet.mjs` or `<dir>/leaflet/index.js`
    fn resolve_bare(&self, name: &str) -> Result<ModuleSpecifier, Error> {
        let dir = self.packages_dir()?;
        let candidates = if Self::is_extension_allowed(name) {
            vec![dir.join(name)]
        } else {
            vec![
                dir.join(format!("{}.js", name)),
                dir.join(format!("{}.mjs", name)),
                dir.join(name).join("index.js"),
            ]
        };

        let found = candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| anyhow!("Package '{}' not found in {}", name, dir.display()))?;

        ModuleSpecifier::from_file_path(&found)
            .map_err(|_| anyhow!("Invalid package path: {}", found.display()))
    }

    fn check_local(&self, resolved: &ModuleSpecifier) -> Result<(), Error> {
        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;

        if !self.is_path_allowed(&path) {
            return Err(anyhow!(
                "Access denied: '{}' is outside the packages directory",
                path.display()
            ));
        }
        Ok(())
    }

    fn check_remote(&self, resolved: &ModuleSpecifier) -> Result<(), Error> {
        if !self.fetch.is_origin_allowed(resolved) {
            return Err(anyhow!(
                "Remote imports from '{}' are forbidden",
                resolved.origin().ascii_serialization()
            ));
        }
        Ok(())
    }
}

impl ModuleLoader for SandboxedLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if specifier.starts_with("data:") || specifier.starts_with("blob:") {
            return Err(anyhow!("Inline module specifiers are forbidden: {}", specifier));
        }

        let resolved = if specifier.starts_with("./") || specifier.starts_with("../") {
            // Relative import - resolve against referrer
            let referrer_url = ModuleSpecifier::parse(referrer)
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            referrer_url
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))?
        } else if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("file://")
        {
            ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid URL '{}': {}", specifier, e))?
        } else if specifier.starts_with('/') {
            ModuleSpecifier::from_file_path(specifier)
                .map_err(|_| anyhow!("Invalid absolute path: {}", specifier))?
        } else {
            self.resolve_bare(specifier)?
        };

        match resolved.scheme() {
            "file" => self.check_local(&resolved)?,
            "http" | "https" => self.check_remote(&resolved)?,
            other => return Err(anyhow!("Unsupported module scheme: {}", other)),
        }

        if !Self::is_extension_allowed(resolved.path()) {
            return Err(anyhow!(
                "Only .js and .mjs modules allowed, got: {}",
                resolved
            ));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let specifier = module_specifier.clone();

        if specifier.scheme() != "file" {
            // Defense in depth: re-check origin
            if let Err(e) = self.check_remote(&specifier) {
                return ModuleLoadResponse::Sync(Err(e));
            }
            let fetch = self.fetch.clone();
            return ModuleLoadResponse::Async(Box::pin(async move {
                let code = fetch_module_source(specifier.clone(), fetch).await?;
                Ok::<_, Error>(ModuleSource::new(
                    ModuleType::JavaScript,
                    ModuleSourceCode::String(code.into()),
                    &specifier,
                    None,
                ))
            }));
        }

        // Defense in depth: re-check path is allowed
        if let Err(e) = self.check_local(&specifier) {
            return ModuleLoadResponse::Sync(Err(e));
        }

        let path = match specifier.to_file_path() {
            Ok(p) => p,
            Err(_) => {
                return ModuleLoadResponse::Sync(Err(anyhow!(
                    "Invalid file path: {}",
                    specifier
                )));
            }
        };

        let code = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                return ModuleLoadResponse::Sync(Err(anyhow!(
                    "Failed to read '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            &specifier,
            None,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader_for(dir: &Path, origins: &[&str]) -> SandboxedLoader {
        SandboxedLoader::new(
            Some(dir),
            FetchConfig {
                allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_resolves_bare_package_name() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("leaflet.js"), "export default 1;").unwrap();
        let loader = loader_for(dir.path(), &[]);

        let resolved = loader
            .resolve("leaflet", "<sandbox:install>", ResolutionKind::DynamicImport)
            .unwrap();
        assert!(resolved.path().ends_with("/leaflet.js"));
    }

    #[test]
    fn test_resolves_package_directory_index() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("markers")).unwrap();
        fs::write(dir.path().join("markers/index.js"), "export default 1;").unwrap();
        let loader = loader_for(dir.path(), &[]);

        let resolved = loader
            .resolve("markers", "<sandbox:install>", ResolutionKind::DynamicImport)
            .unwrap();
        assert!(resolved.path().ends_with("/markers/index.js"));
    }

    #[test]
    fn test_missing_package() {
        let dir = tempdir().unwrap();
        let loader = loader_for(dir.path(), &[]);

        let err = loader
            .resolve("nope", "<sandbox:install>", ResolutionKind::DynamicImport)
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_bare_name_without_packages_dir() {
        let loader = SandboxedLoader::new(None, FetchConfig::default()).unwrap();
        let err = loader
            .resolve("leaflet", "<sandbox:install>", ResolutionKind::DynamicImport)
            .unwrap_err();
        assert!(err.to_string().contains("No packages directory"));
    }

    #[test]
    fn test_blocks_unlisted_remote_origin() {
        let dir = tempdir().unwrap();
        let loader = loader_for(dir.path(), &["https://cdn.example.com"]);

        let err = loader
            .resolve("https://evil.com/payload.js", "<sandbox:install>", ResolutionKind::DynamicImport)
            .unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn test_allows_listed_remote_origin() {
        let dir = tempdir().unwrap();
        let loader = loader_for(dir.path(), &["https://cdn.example.com"]);

        let resolved = loader
            .resolve(
                "https://cdn.example.com/leaflet-1.9.4-esm.js#sha256=abcd",
                "<sandbox:install>",
                ResolutionKind::DynamicImport,
            )
            .unwrap();
        assert_eq!(resolved.fragment(), Some("sha256=abcd"));
    }

    #[test]
    fn test_blocks_path_traversal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.js"), "export default 1;").unwrap();
        let loader = loader_for(dir.path(), &[]);

        let entry = format!("file://{}/test.js", dir.path().display());
        let result = loader.resolve("../../../etc/passwd", &entry, ResolutionKind::Import);
        assert!(result.is_err());
    }

    #[test]
    fn test_blocks_non_js_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.json"), "{}").unwrap();
        let loader = loader_for(dir.path(), &[]);

        let entry = format!("file://{}/entry.js", dir.path().display());
        let err = loader
            .resolve("./data.json", &entry, ResolutionKind::Import)
            .unwrap_err();
        assert!(err.to_string().contains("Only .js and .mjs"));
    }

    #[test]
    fn test_blocks_data_urls() {
        let dir = tempdir().unwrap();
        let loader = loader_for(dir.path(), &[]);
        let err = loader
            .resolve("data:text/javascript,1", "<sandbox:install>", ResolutionKind::DynamicImport)
            .unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }
}
