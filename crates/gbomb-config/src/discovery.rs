//! Config discovery.
//!
//! Two TOML layers are merged, later over earlier:
//! 1. the user file, `config.toml` in `$GBOMB_CONFIG_DIR` or the platform
//!    config dir (`~/.config/gbomb` on Linux)
//! 2. the project file, `gbomb.toml` in the working directory
//!
//! `GBOMB_APP_ID` is applied last.

use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, SdkConfig};

const PROJECT_FILE: &str = "gbomb.toml";
const USER_FILE: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "GBOMB_CONFIG_DIR";

/// Which layer a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    User,
    Project,
}

/// A config file that discovery looked at.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub layer: ConfigLayer,
    pub path: PathBuf,
    /// Found and merged. Missing and unparseable files are `false`.
    pub loaded: bool,
}

/// The merged config plus what went into it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SdkConfig,
    /// Lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// One entry per layer that exists but could not be used.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter_map(|s| s.loaded.then_some(s.path.as_path()))
            .collect()
    }
}

/// Discover and merge every layer. `project_dir` defaults to the working
/// directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], reading the user layer from `config_dir` instead of
/// the environment or platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let user = config_dir
        .map(|dir| dir.join(USER_FILE))
        .or_else(xdg_config_path);
    let project = project_dir.map_or_else(|| PathBuf::from(PROJECT_FILE), |d| d.join(PROJECT_FILE));

    let layers = user
        .map(|p| (ConfigLayer::User, p))
        .into_iter()
        .chain(std::iter::once((ConfigLayer::Project, project)));

    let mut loaded = LoadedConfig {
        config: SdkConfig::new(),
        sources: Vec::new(),
        warnings: Vec::new(),
    };
    for (layer, path) in layers {
        let merged = merge_layer(&mut loaded, &path);
        loaded.sources.push(ConfigSource {
            layer,
            path,
            loaded: merged,
        });
    }

    loaded.config.apply_env();
    loaded.config.validate()?;
    Ok(loaded)
}

/// Read and parse one file.
pub fn load_config_file(path: &Path) -> Result<SdkConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    SdkConfig::from_toml(&text)
}

/// Write `config` to `path`, creating missing directories.
pub fn save_config(config: &SdkConfig, path: &Path) -> Result<()> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Write { path, source }
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(write_err(dir))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(write_err(path))
}

/// The user config file.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|dir| dir.join(USER_FILE))
}

/// `$GBOMB_CONFIG_DIR` when set, else the platform config dir plus `gbomb`.
///
/// Also holds the token file and logs.
pub fn xdg_config_dir() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|dir| dir.join("gbomb")),
    }
}

/// Merge `path` into `loaded.config`. A missing file is skipped silently;
/// a broken one becomes a warning.
fn merge_layer(loaded: &mut LoadedConfig, path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match load_config_file(path) {
        Ok(layer) => {
            tracing::debug!(path = %path.display(), "merged config layer");
            loaded.config.merge(layer);
            true
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping config layer");
            loaded.warnings.push(format!("ignored {}: {}", path.display(), e));
            false
        }
    }
}
