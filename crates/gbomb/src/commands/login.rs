//! Login command - browser login with a pasted redirect URL.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use console::style;
use gbomb_session::{
    AppCallRegistry, AppSwitcher, BrowserFallbackStrategy, LoginBehavior, Session, SessionState,
    TokenCache,
};
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use super::Context;

/// Arguments for the login command.
#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Permissions to request (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub permissions: Vec<String>,

    /// Log in again even if a usable token is cached
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct LoginOutput {
    logged_in: bool,
    expires_at: Option<String>,
    permissions: Vec<String>,
}

/// Prints the login URL instead of launching anything.
#[derive(Debug)]
struct PrintUrlSwitcher;

impl AppSwitcher for PrintUrlSwitcher {
    fn can_open(&self, _url: &Url) -> bool {
        true
    }

    fn open(&self, url: &Url) -> bool {
        eprintln!();
        eprintln!("Open this URL in a browser and log in:");
        eprintln!();
        eprintln!("  {}", style(url).cyan());
        eprintln!();
        eprintln!("Then paste the URL the browser was redirected to:");
        true
    }
}

/// Run the login command.
pub async fn run(args: LoginArgs, ctx: &Context) -> Result<()> {
    let builder = ctx.session_builder()?;
    let policy = ctx.config.session_policy();
    let registry = Arc::new(AppCallRegistry::new(
        ctx.config.app_id()?,
        ctx.config.url_scheme_suffix(),
    ));
    let strategy = BrowserFallbackStrategy::new(
        Arc::new(PrintUrlSwitcher),
        registry.clone(),
        ctx.config.endpoints(),
        true,
        policy.handoff_timeout(),
    );

    if args.force {
        let key = ctx.config.token_cache().key;
        ctx.token_cache().clear(&key).await?;
    }

    let session = Arc::new(
        builder
            .url_scheme_registered(true)
            .permissions(args.permissions.clone())
            .app_call_registry(registry)
            .strategy(Arc::new(strategy))
            .build()
            .await?,
    );

    if session.state() == SessionState::CreatedTokenLoaded {
        session.open().await?;
        if !ctx.json_output {
            println!("Already logged in. Use --force to log in again.");
        }
        return report(&session, ctx);
    }

    let mut opening = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .open_with_behavior(LoginBehavior::WithNoFallbackToWebView)
                .await
        }
    });

    let outcome = tokio::select! {
        pasted = read_redirect(session.clone()) => {
            pasted?;
            opening.await?
        }
        outcome = &mut opening => outcome?,
    };

    match outcome {
        Ok(()) => report(&session, ctx),
        Err(e) => bail!("login failed: {}", e),
    }
}

/// Read pasted redirect URLs until one completes the pending login.
///
/// Lines come from a detached thread so a pending read never holds up exit.
async fn read_redirect(session: Arc<Session>) -> Result<()> {
    let (tx, mut lines) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });

    while let Some(line) = lines.recv().await {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        match Url::parse(text) {
            Ok(url) if session.handle_open_url(&url) => return Ok(()),
            Ok(_) => eprintln!("That URL does not belong to this login; try again:"),
            Err(e) => eprintln!("Not a URL ({}); try again:", e),
        }
    }

    // stdin closed
    session.cancel();
    Ok(())
}

fn report(session: &Session, ctx: &Context) -> Result<()> {
    let output = LoginOutput {
        logged_in: session.is_open(),
        expires_at: session.expiration_date().map(|d| d.to_rfc3339()),
        permissions: session.permissions(),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{} Logged in", style("✓").green());
        match &output.expires_at {
            Some(at) => println!("  Token expires: {}", at),
            None => println!("  Token does not expire"),
        }
        if !output.permissions.is_empty() {
            println!("  Permissions: {}", output.permissions.join(", "));
        }
    }
    Ok(())
}
