//! Worker configuration: defaults, optional JSON file, CLI overrides.

use crate::package::PackageSpec;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Entry script used when no `entry_script` is configured
pub const DEMO_ENTRY_SCRIPT: &str = include_str!("../assets/demo_map.js");

/// Rendering options exposed to the sandbox as `Sandbox.renderOptions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub sizing_mode: String,
    pub min_height: u32,
    /// Let map panes fill their container instead of keeping a fixed aspect ratio
    pub responsive: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            sizing_mode: String::from("stretch_both"),
            min_height: 700,
            responsive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            format: LogFormat::Compact,
        }
    }
}

/// Configuration for the sandbox worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Ordered install targets
    pub packages: Vec<PackageSpec>,
    /// Directory bare package names resolve in (None = names cannot be installed)
    pub packages_dir: Option<PathBuf>,
    /// Allowed origins for remote package locators (empty = remote installs disabled)
    pub allowed_origins: Vec<String>,
    /// Entry script path (None = bundled demo)
    pub entry_script: Option<PathBuf>,
    pub render: RenderOptions,
    /// Maximum heap size in bytes (default: 256MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single script in milliseconds (None = unlimited)
    pub timeout_ms: Option<u64>,
    pub log: LogSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            packages: vec![],
            packages_dir: None,
            allowed_origins: vec![],
            entry_script: None,
            render: RenderOptions::default(),
            max_heap_size: Some(256 * 1024 * 1024), // 256MB default
            timeout_ms: None,
            log: LogSettings::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config '{}'", path.display()))
    }

    /// Build a config from CLI arguments (without the program name).
    ///
    /// `--config` is applied first so other flags override the file.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        let mut config = match find_flag(&args, "--config") {
            Some(path) => Self::from_json_file(Path::new(path))?,
            None => Self::default(),
        };

        let mut cli_packages: Option<Vec<PackageSpec>> = None;
        let mut cli_origins: Option<Vec<String>> = None;
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let mut value = |name: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| anyhow!("{} requires a value", name))
            };
            match flag.as_str() {
                "--config" => {
                    value("--config")?;
                }
                "--package" => cli_packages
                    .get_or_insert_with(Vec::new)
                    .push(PackageSpec::parse(&value("--package")?)),
                "--packages-dir" => config.packages_dir = Some(value("--packages-dir")?.into()),
                "--allow-origin" => cli_origins
                    .get_or_insert_with(Vec::new)
                    .push(value("--allow-origin")?),
                "--entry" => config.entry_script = Some(value("--entry")?.into()),
                "--timeout-ms" => {
                    let raw = value("--timeout-ms")?;
                    config.timeout_ms = Some(
                        raw.parse()
                            .map_err(|e| anyhow!("Invalid --timeout-ms '{}': {}", raw, e))?,
                    );
                }
                "--log-format" => {
                    config.log.format = match value("--log-format")?.as_str() {
                        "json" => LogFormat::Json,
                        "compact" => LogFormat::Compact,
                        other => return Err(anyhow!("Unknown log format: {}", other)),
                    }
                }
                other => return Err(anyhow!("Unknown argument: {}", other)),
            }
        }

        if let Some(packages) = cli_packages {
            config.packages = packages;
        }
        if let Some(origins) = cli_origins {
            config.allowed_origins = origins;
        }

        Ok(config)
    }

    /// Source of the entry script: the configured file or the bundled demo
    pub fn entry_source(&self) -> Result<String> {
        match &self.entry_script {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read entry script '{}'", path.display())),
            None => Ok(DEMO_ENTRY_SCRIPT.to_string()),
        }
    }
}

fn find_flag<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.packages.is_empty());
        assert_eq!(config.render.sizing_mode, "stretch_both");
        assert_eq!(config.render.min_height, 700);
        assert_eq!(config.timeout_ms, None);
        assert!(config.entry_source().unwrap().contains("Sandbox.writeDoc"));
    }

    #[test]
    fn test_cli_overrides() {
        let config = WorkerConfig::from_args([
            "--package",
            "leaflet",
            "--package",
            "https://cdn.example.com/markers-0.2.js",
            "--allow-origin",
            "https://cdn.example.com",
            "--timeout-ms",
            "5000",
            "--log-format",
            "json",
        ])
        .unwrap();

        let names: Vec<&str> = config.packages.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["leaflet", "markers"]);
        assert_eq!(config.allowed_origins, vec!["https://cdn.example.com"]);
        assert_eq!(config.timeout_ms, Some(5000));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_file_then_cli() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.json");
        fs::write(
            &path,
            r#"{
                "packages": ["pkgA", "http://x/pkgB-1.0-whatever.ext"],
                "render": {"min_height": 400},
                "timeout_ms": 100
            }"#,
        )
        .unwrap();

        let config =
            WorkerConfig::from_args(["--config", path.to_str().unwrap(), "--timeout-ms", "250"])
                .unwrap();

        let names: Vec<&str> = config.packages.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["pkgA", "pkgB"]);
        assert_eq!(config.render.min_height, 400);
        assert_eq!(config.render.sizing_mode, "stretch_both");
        assert_eq!(config.timeout_ms, Some(250));
    }

    #[test]
    fn test_rejects_unknown_flag() {
        let err = WorkerConfig::from_args(["--verbose"]).unwrap_err();
        assert!(err.to_string().contains("Unknown argument"));
    }

    #[test]
    fn test_missing_value() {
        let err = WorkerConfig::from_args(["--package"]).unwrap_err();
        assert!(err.to_string().contains("requires a value"));
    }
}
