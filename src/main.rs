//! Shopguard server binary
//!
//! Reads secrets from the environment (see [`shopguard::config`]) and serves
//! the install flow, webhooks and the tenant API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use shopguard::app::{router, spawn_sweeper, AppState};
use shopguard::config::AppConfig;
use shopguard::oauth::HttpPlatformClient;
use shopguard::tenant::MemoryTenantDirectory;

/// Shopguard - tenant auth and abuse protection for Shopify apps
#[derive(Parser, Debug)]
#[command(name = "shopguard")]
#[command(author = "Shopguard Team <team@shopguard.dev>")]
#[command(version)]
#[command(about = "Tenant authentication, rate limiting and webhook middleware server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let client = HttpPlatformClient::new(
        config.api_key.clone(),
        config.api_secret(),
        config.upstream_timeout,
    )?;

    let state = AppState::from_config(
        config,
        Arc::new(MemoryTenantDirectory::new()),
        Arc::new(client),
    )
    .context("failed to initialise application state")?;
    let sweeper = spawn_sweeper(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Shopguard listening on {addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    sweeper.abort();
    tracing::info!("Shopguard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
