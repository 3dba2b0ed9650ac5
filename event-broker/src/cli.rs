use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::broker::{BrokerConfig, DEFAULT_LISTEN};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the event broker, accepting WebSocket connections.
    Broker(BrokerArgs),
    /// Connect to a broker, publish JSON events from stdin and print what arrives.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Milliseconds to wait for clients to acknowledge the close during shutdown.
    #[arg(long, default_value_t = 5000)]
    pub shutdown_grace_ms: u64,

    /// Wait for every client to close, however long it takes.
    #[arg(long, conflicts_with = "shutdown_grace_ms")]
    pub unbounded_shutdown: bool,
}

impl From<&BrokerArgs> for BrokerConfig {
    fn from(args: &BrokerArgs) -> Self {
        let shutdown_grace =
            (!args.unbounded_shutdown).then(|| Duration::from_millis(args.shutdown_grace_ms));
        BrokerConfig {
            listen: args.listen,
            shutdown_grace,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the broker.
    #[arg(long, default_value = "ws://127.0.0.1:8081")]
    pub server: String,
}
