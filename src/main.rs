//! Service entry point: load the YAML config, wire the [`AppContext`],
//! serve the HTTP surface until SIGTERM/ctrl-c.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use a2a_proxy::app::AppContext;
use a2a_proxy::config::ConfigLoader;
use a2a_proxy::http::proxy_router;

#[derive(Debug, Parser)]
#[command(name = "a2a-proxy", version, about = "Transparent A2A proxy over Azure Service Bus")]
struct Args {
    /// Path to the proxy configuration file.
    #[arg(default_value = "config/proxy-config.yaml")]
    config: PathBuf,

    /// Agent registry filename, resolved next to the config file unless
    /// the config embeds an inline registry.
    #[arg(long, default_value = "agent-registry.yaml")]
    registry: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_dir = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config_filename = args
        .config
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("proxy-config.yaml")
        .to_string();

    let loader = ConfigLoader::new(config_dir)?;
    let config = loader.load_proxy_config(&config_filename)?;
    let agents = loader.resolve_agents(&config, &args.registry)?;

    let port = config.proxy.port;
    let ctx = AppContext::bootstrap(config, agents).await?;
    let app = proxy_router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "A2A proxy listening");

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
        })
        .await?;

    shutdown_ctx.shutdown().await;
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM, whichever arrives first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
