use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{Envelope, Event, IndexedEvent},
};

/// WebSocket client speaking the broker protocol.
pub struct BrokerClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl BrokerClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        Ok(Self { socket })
    }

    pub async fn publish(&mut self, event: Event) -> Result<()> {
        self.send(&Envelope::single(event)).await
    }

    pub async fn request_history(&mut self) -> Result<()> {
        self.send(&Envelope::history_request()).await
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let encoded = envelope.to_json().context("failed to encode message")?;
        self.send_raw(&encoded).await
    }

    /// Sends `text` unchanged, whether or not it is a valid protocol message.
    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::text(text.to_owned()))
            .await
            .context("failed to send message")
    }

    /// Waits for the next protocol message. `None` means the broker closed the
    /// connection; call [`BrokerClient::close`] afterwards to finish the handshake.
    pub async fn next_message(&mut self) -> Result<Option<Envelope>> {
        while let Some(message) = self.socket.next().await {
            match message.context("failed to read from broker")? {
                Message::Text(text) => {
                    let envelope = serde_json::from_str(text.as_str()).with_context(|| {
                        format!("unexpected message from broker: {}", text.as_str())
                    })?;
                    return Ok(Some(envelope));
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Requests the history and waits for the response, discarding any
    /// broadcasts that arrive first.
    pub async fn history(&mut self) -> Result<Vec<IndexedEvent>> {
        self.request_history().await?;
        loop {
            match self.next_message().await? {
                Some(Envelope::HistoryResponse { events }) => return Ok(events),
                Some(_) => continue,
                None => bail!("broker closed the connection before answering"),
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        match self.socket.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(error) => Err(error).context("failed to close connection"),
        }
    }
}

/// Interactive client: publishes JSON lines from stdin and prints whatever
/// the broker sends back.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = BrokerClient::connect(&args.server).await?;
    info!("connected to {}", args.server);
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut client, &mut stdin, &mut input).await?;
    if let Err(error) = client.close().await {
        warn!(?error, "failed to close connection cleanly");
    }

    Ok(())
}

async fn run_client_loop(
    client: &mut BrokerClient,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = client.next_message() => {
                if !handle_server_message(server_message?).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, client).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(message: Option<Envelope>) -> Result<bool> {
    match message {
        Some(envelope) => {
            for line in render(&envelope) {
                write_stdout(&line).await?;
            }
            Ok(true)
        }
        None => {
            write_stdout("*** broker closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &mut BrokerClient,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving").await?;
        return Ok(false);
    }

    if text.eq_ignore_ascii_case("/history") {
        client.request_history().await?;
        return Ok(true);
    }

    match serde_json::from_str::<Event>(text) {
        Ok(event) => client.publish(event).await?,
        Err(error) => write_stderr(&format!("!!! not a json event: {error}")).await?,
    }
    Ok(true)
}

/// Formats a broker message as terminal lines.
pub fn render(envelope: &Envelope) -> Vec<String> {
    match envelope {
        Envelope::Single { event } => vec![format!("event {event}")],
        Envelope::HistoryResponse { events } => {
            let mut lines = Vec::with_capacity(events.len() + 1);
            lines.push(format!("history: {} event(s)", events.len()));
            lines.extend(
                events
                    .iter()
                    .map(|entry| format!("  #{} {}", entry.index, entry.event)),
            );
            lines
        }
        Envelope::HistoryRequest => Vec::new(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
