use clap::Parser;
use rebalancer_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rebalancerd", version, about = "Delegated rebalancing REST service")]
struct Cli {
    /// TOML config file; defaults apply when it does not exist.
    #[arg(long, default_value = "rebalancer.toml", env = "REBALANCER_CONFIG")]
    config: PathBuf,
    /// REST socket address to bind, overrides the config file.
    #[arg(long, env = "REBALANCER_LISTEN")]
    listen: Option<SocketAddr>,
    /// Snapshot file, overrides the config file.
    #[arg(long, env = "REBALANCER_SNAPSHOT")]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "rebalancer_service=info,rebalancer_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(snapshot) = cli.snapshot {
        config.snapshot_path = snapshot;
    }

    let listen = config.listen;
    info!(
        config = %cli.config.display(),
        snapshot = %config.snapshot_path.display(),
        signer_keys = config.signer_keys.len(),
        "Starting rebalancer-service"
    );
    let state = ServiceState::bootstrap(config)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("rebalancer-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
