//! Gbomb - command line client for the Gbomb SDK.
//!
//! Logs in through the system browser, keeps the token in the user's
//! config directory, and sends batched graph reads with it.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{config, get, login, logout, status};

/// Gbomb SDK command line client
#[derive(Parser)]
#[command(name = "gbomb")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// App id to use instead of the configured one
    #[arg(long, global = true)]
    app_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in through the system browser
    Login(login::LoginArgs),

    /// Show the cached session
    Status(status::StatusArgs),

    /// Forget the cached token
    Logout(logout::LogoutArgs),

    /// Read one or more graph paths in a single batch
    Get(get::GetArgs),

    /// Show configuration
    Config(config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gbomb=debug,gbomb_session=debug,gbomb_request=debug,info"
    } else {
        "gbomb=warn,warn"
    };

    let log_dir = gbomb_config::xdg_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "gbomb.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new(filter)),
        )
        .with(
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "gbomb=trace,gbomb_session=trace,gbomb_request=trace,info",
                )),
        )
        .init();

    let loaded = gbomb_config::load_config(None)?;
    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }

    let mut sdk_config = loaded.config.clone();
    if let Some(app_id) = &cli.app_id {
        sdk_config
            .app
            .get_or_insert_with(Default::default)
            .app_id = Some(app_id.clone());
    }

    let ctx = commands::Context {
        config: sdk_config,
        loaded,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Login(args) => login::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Logout(args) => logout::run(args, &ctx).await,
        Commands::Get(args) => get::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
