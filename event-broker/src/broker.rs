//! Broker startup and shutdown.
//!
//! [`Broker::start`] binds the listener and spawns an accept task that owns
//! every connection task. [`Broker::close`] signals that task, which requests
//! a close from every client, waits for the handshakes (bounded by the
//! configured grace period) and finally drops the listener.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{oneshot, watch},
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{connection, registry::ConnectionRegistry, router::Router, store::EventStore};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8081";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Listening,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,
    /// How long shutdown waits for clients to acknowledge the close before
    /// dropping them. `None` waits indefinitely.
    pub shutdown_grace: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
            shutdown_grace: Some(DEFAULT_SHUTDOWN_GRACE),
        }
    }
}

impl BrokerConfig {
    pub fn on_port(port: u16) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], port)),
            ..Self::default()
        }
    }
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that were sent a close request.
    pub close_requested: usize,
    /// Connection tasks aborted because the grace period ran out.
    pub forced: usize,
}

/// Handle to a running broker.
pub struct Broker {
    local_addr: SocketAddr,
    router: Arc<Router>,
    lifecycle: watch::Receiver<LifecycleState>,
    shutdown: oneshot::Sender<()>,
    accept_task: tokio::task::JoinHandle<ShutdownReport>,
}

/// Starts a broker listening on every interface at `port`.
///
/// Returns `None` when the port cannot be bound.
pub async fn new_broker(port: u16, store: Arc<dyn EventStore>) -> Option<Broker> {
    Broker::start(BrokerConfig::on_port(port), store).await
}

/// Shuts the broker down, waiting for connected clients to close.
pub async fn close_broker(broker: Broker) {
    broker.close().await;
}

impl Broker {
    /// Binds `config.listen` and starts accepting connections.
    ///
    /// Only resolves once the listener is bound and able to accept, so callers
    /// can connect as soon as they hold the handle. Bind failures are logged
    /// and reported as `None`.
    pub async fn start(config: BrokerConfig, store: Arc<dyn EventStore>) -> Option<Self> {
        let (lifecycle_tx, lifecycle) = watch::channel(LifecycleState::Uninitialized);
        lifecycle_tx.send_replace(LifecycleState::Starting);

        let listener = match TcpListener::bind(config.listen).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!(listen = %config.listen, %error, "failed to bind broker listener");
                return None;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(error) => {
                warn!(%error, "listener has no local address");
                return None;
            }
        };

        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(store, registry));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        lifecycle_tx.send_replace(LifecycleState::Listening);
        info!(%local_addr, "listener ready");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&router),
            shutdown_rx,
            lifecycle_tx,
            config.shutdown_grace,
        ));

        Some(Self {
            local_addr,
            router,
            lifecycle,
            shutdown: shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can use to reach this broker.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn connection_count(&self) -> usize {
        self.router.registry().len()
    }

    /// Connections that finished the handshake and receive broadcasts.
    pub fn open_connections(&self) -> usize {
        self.router.registry().open_count()
    }

    /// Closes every client connection, then the listener.
    pub async fn close(self) -> ShutdownReport {
        let Broker {
            shutdown,
            accept_task,
            ..
        } = self;

        // The accept task only ends through this signal, so a send error means it panicked.
        let _ = shutdown.send(());
        match accept_task.await {
            Ok(report) => report,
            Err(error) => {
                warn!(?error, "accept task ended abnormally");
                ShutdownReport::default()
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    mut shutdown: oneshot::Receiver<()>,
    lifecycle: watch::Sender<LifecycleState>,
    grace: Option<Duration>,
) -> ShutdownReport {
    let mut connections = JoinSet::new();

    loop {
        select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                handle_accept_result(accepted, &router, &mut connections);
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(finished);
            }
        }
    }

    lifecycle.send_replace(LifecycleState::Closing);
    info!(connections = router.registry().len(), "broker shutting down");
    let report = close_connections(&router, &mut connections, grace).await;

    drop(listener);
    lifecycle.send_replace(LifecycleState::Closed);
    info!(
        close_requested = report.close_requested,
        forced = report.forced,
        "broker closed"
    );
    report
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    router: &Arc<Router>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let router = Arc::clone(router);
            let id = router.registry().next_id();
            debug!(connection = id, %peer, "accepted tcp connection");
            connections.spawn(async move {
                if let Err(error) = connection::serve(id, stream, peer, router).await {
                    warn!(connection = id, %peer, error = ?error, "connection closed with error");
                }
            });
        }
        Err(error) => warn!(error = ?error, "failed to accept connection"),
    }
}

fn log_connection_exit(finished: Result<(), JoinError>) {
    if let Err(error) = finished {
        if error.is_panic() {
            warn!(?error, "connection task panicked");
        }
    }
}

async fn close_connections(
    router: &Router,
    connections: &mut JoinSet<()>,
    grace: Option<Duration>,
) -> ShutdownReport {
    let close_requested = router.registry().begin_close();

    let drained = async {
        while let Some(finished) = connections.join_next().await {
            log_connection_exit(finished);
        }
    };

    let forced = match grace {
        None => {
            drained.await;
            0
        }
        Some(grace) => {
            let outcome = timeout(grace, drained).await;
            if outcome.is_ok() {
                0
            } else {
                let stalled = connections.len();
                warn!(stalled, ?grace, "clients did not acknowledge close; forcing");
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                router.registry().clear();
                stalled
            }
        }
    };

    ShutdownReport {
        close_requested,
        forced,
    }
}
