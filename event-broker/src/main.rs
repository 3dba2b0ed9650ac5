use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use event_broker::{
    broker::{Broker, BrokerConfig},
    cli::{Cli, Command},
    client,
    store::MemoryStore,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            let config = BrokerConfig::from(&args);
            let broker = Broker::start(config, Arc::new(MemoryStore::new()))
                .await
                .with_context(|| format!("failed to start broker on {}", args.listen))?;
            info!("broker listening on {}", broker.local_addr());

            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }

            let report = broker.close().await;
            info!(
                close_requested = report.close_requested,
                forced = report.forced,
                "broker stopped"
            );
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
