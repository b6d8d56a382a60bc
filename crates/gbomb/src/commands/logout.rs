//! Logout command - forgets the cached token.

use anyhow::Result;
use clap::Args;
use console::style;
use gbomb_session::{SessionState, TokenCache};
use serde::Serialize;

use super::Context;

/// Arguments for the logout command.
#[derive(Args, Debug)]
pub struct LogoutArgs {}

#[derive(Debug, Serialize)]
struct LogoutOutput {
    was_logged_in: bool,
}

/// Run the logout command.
pub async fn run(_args: LogoutArgs, ctx: &Context) -> Result<()> {
    let session = ctx.session_builder()?.build().await?;
    let was_logged_in = session.state() == SessionState::CreatedTokenLoaded;

    if was_logged_in {
        session.open().await?;
        session.close().await;
    } else {
        // Nothing usable was loaded; still drop whatever is on disk.
        let key = ctx.config.token_cache().key;
        ctx.token_cache().clear(&key).await?;
    }
    tracing::info!(was_logged_in, "logged out");

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&LogoutOutput { was_logged_in })?
        );
    } else if was_logged_in {
        println!("{} Logged out", style("✓").green());
    } else {
        println!("Not logged in.");
    }
    Ok(())
}
