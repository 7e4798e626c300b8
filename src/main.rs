use anyhow::{Context, Result};
use clap::Parser;
use metaqueries_server::services::federation::FederationService;
use metaqueries_server::services::sources::SourceRegistry;
use metaqueries_server::{cli, config, openapi, routes, state};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind metaqueries-server listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err)
            .with_context(|| format!("failed to bind metaqueries-server listener on {addr}")),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested; cancelling in-flight query batches");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::FederationConfig::from_env()?;
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build http client")?;
    let registry = Arc::new(SourceRegistry::from_config(&config, http));
    if registry.get(registry.default_source()).is_none() {
        tracing::warn!(
            default_source = %registry.default_source(),
            "default source has no url configured; queries without an explicit source will fail"
        );
    }
    tracing::info!(
        sources = registry.len(),
        default_source = %registry.default_source(),
        "series sources configured"
    );

    let shutdown = CancellationToken::new();
    let state = state::AppState {
        federation: Arc::new(FederationService::new(registry)),
        shutdown: shutdown.clone(),
    };

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "metaqueries-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    shutdown.cancel();
    Ok(())
}
