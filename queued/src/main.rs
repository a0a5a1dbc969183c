use clap::Parser;
use queued::{config::ServiceConfig, lifecycle};
use std::process::exit;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod opt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = opt::Opts::parse();
    match run(opt).await {
        Ok(()) => exit(0),
        Err(e) => {
            tracing::error!("{:?}", e);
            exit(1);
        }
    }
}

async fn run(opt: opt::Opts) -> anyhow::Result<()> {
    let mut cfg = ServiceConfig::load(&opt.config)?;
    if let Some(host) = opt.host {
        cfg.server_host = host;
    }
    if let Some(port) = opt.port {
        cfg.server_port = Some(port);
    }
    tracing::info!("Loaded config from {}", opt.config.display());

    let shutdown = CancellationToken::new();
    lifecycle::install_signal_handler(shutdown.clone())?;
    lifecycle::run_service(cfg, shutdown).await
}
