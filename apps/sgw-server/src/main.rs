use clap::Parser;
use sgw_server::config::GatewayConfig;
use sgw_server::node::Gateway;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Document-store protocol gateway.
#[derive(Debug, Parser)]
#[command(name = "sgw-server", version)]
struct Args {
    /// YAML configuration file; environment variables are used when it does not exist
    #[arg(short, long, default_value = "sgw.yaml")]
    config: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "SGW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Loading configuration from: {}", args.config);

    let config = if std::path::Path::new(&args.config).exists() {
        GatewayConfig::load_from_file(&args.config)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        GatewayConfig::load_from_env()?
    };

    let mut gateway = Gateway::new(config).await?;
    gateway.start().await?;

    tracing::info!(
        data = ?gateway.data_addr(),
        sd = ?gateway.sd_addr(),
        http = ?gateway.http_addr(),
        "Gateway is ready"
    );

    let stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Received shutdown signal, gracefully shutting down...");
            None
        }
        result = gateway.stopped() => {
            match &result {
                Ok(()) => tracing::warn!("Gateway planes stopped serving, shutting down..."),
                Err(e) => tracing::error!(error = %e, "Gateway planes failed, shutting down..."),
            }
            Some(result)
        }
    };
    gateway.shutdown().await?;

    tracing::info!("Shutdown complete");
    if let Some(Err(e)) = stopped {
        return Err(e.into());
    }
    Ok(())
}
