//! Configuration system for the Gbomb SDK.
//!
//! Provides TOML-based configuration with:
//! - App identity (`[app]`: app id, URL scheme suffix)
//! - Service endpoints (`[endpoints]`)
//! - Session policy (`[session]`: token extension threshold, cooldowns, hand-off timeout)
//! - Request policy (`[request]`: retry limit, timeout, response cache)
//! - Token cache location (`[token_cache]`)
//!
//! Config file layering follows XDG user config + project-local overrides.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, ConfigSource, LoadedConfig, load_config, load_config_file,
    load_config_with_options, save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
