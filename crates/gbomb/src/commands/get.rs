//! Get command - reads graph paths in one batch.

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use console::Style;
use gbomb_request::{
    ErrorBehavior, GraphRequest, RequestConnection, ResponseCache, create_transport,
};
use gbomb_session::{SessionState, SharedSession};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::Context;

/// Arguments for the get command.
#[derive(Args, Debug)]
pub struct GetArgs {
    /// Graph paths to read, e.g. `me` or `me/friends`
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Query parameter added to every request (key=value, repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Send without the cached token
    #[arg(long)]
    pub anonymous: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got `{}`", raw)),
    }
}

/// Run the get command.
pub async fn run(args: GetArgs, ctx: &Context) -> Result<()> {
    let session = if args.anonymous {
        None
    } else {
        let session = ctx.session_builder()?.build().await?;
        if session.state() == SessionState::CreatedTokenLoaded {
            session.open().await?;
            Some(Arc::new(session))
        } else {
            tracing::warn!("no cached token; sending requests without one");
            None
        }
    };

    let request_policy = ctx.config.request_policy();
    let transport = create_transport(&request_policy)?;
    let mut connection = RequestConnection::from_config(transport, &ctx.config)?
        .with_cache(Arc::new(ResponseCache::from_config(&request_policy)));

    let mut pending = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let mut request = GraphRequest::get(path.as_str());
        for (k, v) in &args.params {
            request = request.with_param(k.as_str(), v.as_str());
        }
        if let Some(session) = &session {
            request = request.with_session(session.clone() as SharedSession);
        }

        let (tx, rx) = oneshot::channel();
        connection.add_request_with(request, ErrorBehavior::RETRY, None, move |result| {
            let _ = tx.send(result);
        });
        pending.push((path.clone(), rx));
    }

    let summary = connection.start().await;
    tracing::debug!(
        requests = summary.requests,
        round_trips = summary.round_trips,
        "batch finished"
    );

    let total = pending.len();
    let mut results = Map::new();
    let mut failures = 0;
    for (path, rx) in pending {
        let value = match rx.await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                failures += 1;
                serde_json::json!({ "error": e.to_string() })
            }
            Err(_) => {
                failures += 1;
                serde_json::json!({ "error": "cancelled" })
            }
        };
        results.insert(path, value);
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&Value::Object(results))?);
    } else {
        let dim = Style::new().dim();
        for (path, value) in &results {
            println!("{}", Style::new().bold().apply_to(path));
            println!("{}", serde_json::to_string_pretty(value)?);
            println!();
        }
        if ctx.verbose {
            println!(
                "{}",
                dim.apply_to(format!(
                    "{} request(s), {} round trip(s)",
                    summary.requests, summary.round_trips
                ))
            );
        }
    }

    if failures > 0 {
        bail!("{} of {} request(s) failed", failures, total);
    }
    Ok(())
}
