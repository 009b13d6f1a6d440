use anyhow::Context;
use clap::Parser;
use fluxgate::config::FluxGateConfig;
use fluxgate::server::Server;
use tracing_subscriber::EnvFilter;

/// Distributed HTTP rate-limiting gate.
#[derive(Debug, Parser)]
#[command(name = "fluxgate", version, about)]
struct Args {
    /// Bind address, overriding FLUXGATE_BIND_ADDRESS.
    #[arg(long)]
    bind: Option<String>,

    /// Store URI, overriding FLUXGATE_STORE_URI.
    #[arg(long)]
    store_uri: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = FluxGateConfig::from_env().context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(uri) = args.store_uri {
        config.store.uri = uri;
    }

    let server = Server::new(config).await.context("starting fluxgate")?;
    server.run().await.context("running fluxgate")?;
    Ok(())
}
