//! CLI command implementations.

pub mod config;
pub mod get;
pub mod login;
pub mod logout;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use gbomb_config::{LoadedConfig, SdkConfig};
use gbomb_session::{SessionBuilder, SharedTokenCache, create_token_cache};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolved configuration, command line overrides applied.
    pub config: SdkConfig,
    /// The config as discovered on disk, with its sources.
    pub loaded: LoadedConfig,
    /// Whether to output JSON.
    pub json_output: bool,
    /// Whether verbose mode is enabled.
    pub verbose: bool,
}

impl Context {
    /// Directory holding the token file.
    pub fn token_dir(&self) -> PathBuf {
        self.config
            .token_cache()
            .dir
            .or_else(gbomb_config::xdg_config_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn token_cache(&self) -> SharedTokenCache {
        create_token_cache(&self.token_dir())
    }

    /// Session builder for the configured app, backed by the token file.
    pub fn session_builder(&self) -> Result<SessionBuilder> {
        let builder = SessionBuilder::from_config(&self.config)
            .context("no app id configured; pass --app-id, set GBOMB_APP_ID or [app].app_id")?;
        Ok(builder.token_cache(self.token_cache()))
    }
}
