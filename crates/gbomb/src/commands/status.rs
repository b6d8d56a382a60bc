//! Status command - shows the cached session.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use gbomb_session::{FileTokenCache, SessionState, TokenCache};
use serde::Serialize;

use super::Context;

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Also show granted permissions and refresh dates
    #[arg(short, long)]
    pub detailed: bool,
}

/// Status for JSON output.
#[derive(Debug, Serialize)]
struct StatusOutput {
    app_id: String,
    state: &'static str,
    logged_in: bool,
    expires_at: Option<String>,
    should_extend: bool,
    permissions: Vec<String>,
    token_file: String,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let builder = ctx.session_builder()?;
    let token_file = FileTokenCache::new(&ctx.token_dir());

    // Building the session drops an expired grant; read the raw entry first
    // so it still shows up.
    let key = ctx.config.token_cache().key;
    let grant = token_file.get(&key).await?;
    let session = builder.build().await?;

    let logged_in = session.state() == SessionState::CreatedTokenLoaded;
    if logged_in {
        session.open().await?;
    }

    let output = StatusOutput {
        app_id: session.app_id().to_string(),
        state: session.state().description(),
        logged_in,
        expires_at: grant
            .as_ref()
            .and_then(|g| g.expiration_date)
            .map(|d| d.to_rfc3339()),
        should_extend: logged_in && session.should_extend_access_token(),
        permissions: grant
            .as_ref()
            .map(|g| g.permissions.iter().cloned().collect())
            .unwrap_or_default(),
        token_file: token_file.token_path().display().to_string(),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!("{}", style("Gbomb Session Status").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!("  {} {}", dim.apply_to("App:"), output.app_id);
    if output.logged_in {
        println!(
            "  {} {}",
            dim.apply_to("Session:"),
            Style::new().green().apply_to("● logged in")
        );
    } else {
        println!(
            "  {} {}",
            dim.apply_to("Session:"),
            Style::new().red().apply_to("○ not logged in")
        );
    }
    match (&output.expires_at, &grant) {
        (Some(at), _) => println!("  {} {}", dim.apply_to("Expires:"), at),
        (None, Some(_)) => println!("  {} never", dim.apply_to("Expires:")),
        (None, None) => {}
    }
    if output.should_extend {
        println!(
            "  {} due; the next request will extend it",
            dim.apply_to("Extension:")
        );
    }

    if args.detailed {
        println!();
        println!("  {} {}", dim.apply_to("State:"), output.state);
        println!("  {} {}", dim.apply_to("Token file:"), output.token_file);
        if let Some(grant) = &grant {
            println!("  {} {:?}", dim.apply_to("Login type:"), grant.login_type);
            println!(
                "  {} {}",
                dim.apply_to("Refreshed:"),
                grant.refresh_date.to_rfc3339()
            );
            if !output.permissions.is_empty() {
                println!(
                    "  {} {}",
                    dim.apply_to("Permissions:"),
                    output.permissions.join(", ")
                );
            }
        }
    }

    if ctx.verbose {
        for path in ctx.loaded.loaded_from() {
            println!("  {} {}", dim.apply_to("Config:"), path.display());
        }
    }

    println!();
    Ok(())
}
