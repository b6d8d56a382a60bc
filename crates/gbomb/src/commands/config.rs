//! Config command - shows the resolved configuration.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::Style;
use gbomb_config::{
    AppConfig, ConfigLayer, EndpointsConfig, RequestConfig, SdkConfig, SessionPolicyConfig,
    TokenCacheConfig,
};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Show the user configuration file path
    Path,

    /// Write a user config file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Path => cmd_path(),
        ConfigCommand::Init { force } => cmd_init(force),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let config = &ctx.config;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let endpoints = config.endpoints();
    let session = config.session_policy();
    let request = config.request_policy();

    println!("[app]");
    println!(
        "  app_id            = {}",
        config.app_id().unwrap_or("(not set)")
    );
    println!("  url_scheme_suffix = {:?}", config.url_scheme_suffix());
    println!("[endpoints]");
    println!("  graph_base_url    = {}", endpoints.graph_base_url);
    println!("  dialog_base_url   = {}", endpoints.dialog_base_url);
    println!("  native_auth_scheme = {}", endpoints.native_auth_scheme);
    println!("[session]");
    println!("  extension_threshold     = {}", session.extension_threshold);
    println!("  extension_cooldown_secs = {}", session.extension_cooldown_secs);
    println!("  permissions_refresh_secs = {}", session.permissions_refresh_secs);
    println!("  handoff_timeout_secs    = {}", session.handoff_timeout_secs);
    println!("[request]");
    println!("  max_retry_limit   = {}", request.max_retry_limit);
    println!("  timeout_secs      = {}", request.timeout_secs);
    println!("  cache_max_entries = {}", request.cache_max_entries);
    println!("  cache_ttl_secs    = {}", request.cache_ttl_secs);

    if !ctx.loaded.warnings.is_empty() {
        println!();
        for warning in &ctx.loaded.warnings {
            println!("{} {}", Style::new().yellow().apply_to("warning:"), warning);
        }
    }

    if ctx.verbose {
        println!();
        println!("{}", dim.apply_to("# raw"));
        println!("{}", config.to_toml()?);
    }
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let dim = Style::new().dim();
    let green = Style::new().green();

    println!("Config files (lowest precedence first):");
    for source in &ctx.loaded.sources {
        let layer = match source.layer {
            ConfigLayer::User => "user   ",
            ConfigLayer::Project => "project",
        };
        if source.loaded {
            println!("  {} {} {}", green.apply_to("●"), layer, source.path.display());
        } else {
            println!(
                "  {} {} {} {}",
                dim.apply_to("○"),
                layer,
                source.path.display(),
                dim.apply_to("(not loaded)")
            );
        }
    }
    println!("  {} GBOMB_APP_ID", dim.apply_to("env"));
    Ok(())
}

fn cmd_path() -> Result<()> {
    match gbomb_config::xdg_config_path() {
        Some(path) => println!("{}", path.display()),
        None => bail!("could not determine the config directory"),
    }
    Ok(())
}

fn cmd_init(force: bool) -> Result<()> {
    let Some(path) = gbomb_config::xdg_config_path() else {
        bail!("could not determine the config directory");
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let defaults = SdkConfig {
        app: Some(AppConfig::default()),
        endpoints: Some(EndpointsConfig::default()),
        session: Some(SessionPolicyConfig::default()),
        request: Some(RequestConfig::default()),
        token_cache: Some(TokenCacheConfig::default()),
    };
    gbomb_config::save_config(&defaults, &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
