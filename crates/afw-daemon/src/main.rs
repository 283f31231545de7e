// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use afw_daemon::{build_app, build_state, config::Config};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "afw-daemon", version, about = "Agent firewall gateway daemon")]
struct Args {
    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("afw=debug,afw_daemon=debug,afw_supervisor=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env().context("load configuration")?;
    let bind = format!("{}:{}", config.bind, config.port);

    let state = build_state(config)?;
    state.store.init().await.context("create data directory")?;

    // Close the crash window before accepting any traffic: nothing on disk
    // may still claim to be running.
    let recovered = state
        .store
        .mark_aborted_on_startup()
        .await
        .context("startup recovery")?;
    if recovered > 0 {
        info!(recovered, "recovered interrupted sessions");
    }

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "afw-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
