use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "workpack.toml";
pub const CONFIG_ENV: &str = "WORKPACK_CONFIG";

/// Settings read from `workpack.toml`.
///
/// Relative paths are resolved against the directory holding the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkpackConfig {
    pub dotnet_root: Option<PathBuf>,
    pub user_profile_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub package_feeds: Vec<PathBuf>,
    pub package_cache_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub dependent_prefix: Option<String>,
    /// Launcher for the elevated server, e.g. `["sudo", "-n"]`.
    pub elevation_command: Vec<String>,
}

impl WorkpackConfig {
    pub fn parse(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse workpack config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config =
            Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(match path.parent() {
            Some(base) => config.relative_to(base),
            None => config,
        })
    }

    fn relative_to(self, base: &Path) -> Self {
        let absolute = |path: PathBuf| {
            if path.is_relative() {
                base.join(path)
            } else {
                path
            }
        };
        Self {
            dotnet_root: self.dotnet_root.map(absolute),
            user_profile_dir: self.user_profile_dir.map(absolute),
            temp_dir: self.temp_dir.map(absolute),
            package_feeds: self.package_feeds.into_iter().map(absolute).collect(),
            package_cache_dir: self.package_cache_dir.map(absolute),
            log_dir: self.log_dir.map(absolute),
            dependent_prefix: self.dependent_prefix,
            elevation_command: self.elevation_command,
        }
    }
}

/// Picks the config file: `--config`, then `$WORKPACK_CONFIG`, then
/// `workpack.toml` in the dotnet root. Only the last one may be missing.
pub fn config_path(
    explicit: Option<&Path>,
    env_value: Option<PathBuf>,
    dotnet_root: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_value.filter(|path| !path.as_os_str().is_empty()) {
        return Some(path);
    }
    dotnet_root
        .map(|root| root.join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}

pub fn load_config(path: Option<&Path>) -> Result<WorkpackConfig> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            WorkpackConfig::load(path)
        }
        None => Ok(WorkpackConfig::default()),
    }
}
