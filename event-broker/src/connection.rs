use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, select, sync::mpsc};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, info, trace};

use crate::{
    registry::{ConnectionId, Outbound},
    router::Router,
};

const CLOSE_REASON: &str = "broker shutting down";

/// Runs one client connection from TCP accept to close.
///
/// The connection is registered before the WebSocket handshake and removed
/// when this function returns, whichever side ended it.
pub async fn serve(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
) -> Result<()> {
    let registry = Arc::clone(router.registry());
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    if !registry.register(id, peer, outbound_tx) {
        debug!(connection = id, %peer, "refusing connection while broker is closing");
        return Ok(());
    }

    let result = run_session(id, stream, peer, &router, outbound_rx).await;
    registry.remove(id);
    info!(connection = id, %peer, "client disconnected");
    result
}

async fn run_session(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    router: &Router,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .with_context(|| format!("websocket handshake with {peer} failed"))?;

    if router.registry().mark_open(id) {
        info!(connection = id, %peer, "client connected");
    } else {
        // Shutdown started during the handshake; a Close request is already queued.
        debug!(connection = id, "connection opened after close was requested");
    }

    drive(id, socket, router, &mut outbound).await
}

async fn drive(
    id: ConnectionId,
    socket: WebSocketStream<TcpStream>,
    router: &Router,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    let (mut sink, mut inbound) = socket.split();
    let mut closing = false;

    loop {
        select! {
            message = inbound.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        // Keep reading until the peer acknowledges, but stop routing.
                        if !closing {
                            router.route(id, text);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        // A peer-initiated close leaves our reply queued in the socket
                        // until the next write; push it out before dropping the stream.
                        if !closing {
                            if let Err(error) = sink.flush().await {
                                debug!(connection = id, ?error, "failed to flush close reply");
                            }
                        }
                        break;
                    }
                    None => break,
                    Some(Ok(Message::Binary(_))) => {
                        trace!(connection = id, "ignoring binary frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(connection = id, ?error, "websocket read failed");
                        break;
                    }
                }
            }
            queued = outbound.recv(), if !closing => {
                match queued {
                    Some(Outbound::Text(text)) => {
                        if let Err(error) = sink.send(Message::Text(text)).await {
                            debug!(connection = id, ?error, "failed to deliver message");
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        closing = true;
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: CLOSE_REASON.into(),
                        };
                        if let Err(error) = sink.send(Message::Close(Some(frame))).await {
                            debug!(connection = id, ?error, "failed to send close frame");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}
