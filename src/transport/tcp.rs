//! TCP transport - newline-delimited JSON on two sockets
//!
//! Information Hiding:
//! - Line framing and JSON codec hidden behind `write_line`/`read_line`
//! - Registration channel: one request line, one response line, reconnect on failure
//! - Data channel: a `DataHello` line, an acknowledgement, then frames both ways
//! - Orchestrator-side accept loops live here; `OrchestratorServer` wires them up

use super::{AgentTransport, ConnectionHub, DataChannel};
use crate::config::AgentConfig;
use crate::core::{AgentId, DataHello, Frame, RegistrationRequest, RegistrationResponse};
use crate::error::{BusError, Result};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` once the peer closed the connection
pub(crate) async fn read_line<R, T>(lines: &mut Lines<R>) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match lines.next_line().await? {
        Some(line) => Ok(Some(serde_json::from_str(&line)?)),
        None => Ok(None),
    }
}

type LineReader = Lines<BufReader<OwnedReadHalf>>;

fn split(stream: TcpStream) -> (LineReader, OwnedWriteHalf) {
    let (read, write) = stream.into_split();
    (BufReader::new(read).lines(), write)
}

struct RegistrationConnection {
    lines: LineReader,
    writer: OwnedWriteHalf,
}

impl RegistrationConnection {
    async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BusError::Transport(format!("cannot reach orchestrator at {addr}: {e}")))?;
        let (lines, writer) = split(stream);
        Ok(Self { lines, writer })
    }

    async fn exchange(&mut self, request: &RegistrationRequest) -> Result<RegistrationResponse> {
        write_line(&mut self.writer, request).await?;
        read_line(&mut self.lines)
            .await?
            .ok_or_else(|| BusError::Transport("registration channel closed".to_string()))
    }
}

/// Agent-side TCP transport
pub struct TcpAgentTransport {
    registration_addr: String,
    message_addr: String,
    request_timeout: Duration,
    inbound_buffer: usize,
    registration: Mutex<Option<RegistrationConnection>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpAgentTransport {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            registration_addr: config.registration_addr(),
            message_addr: config.message_addr(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            inbound_buffer: config.inbound_buffer_size.max(1),
            registration: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentTransport for TcpAgentTransport {
    async fn request(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        let mut slot = self.registration.lock().await;
        // taken out while in use: a failed or cancelled exchange leaves no
        // half-read connection behind, the next request reconnects
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => RegistrationConnection::connect(&self.registration_addr).await?,
        };

        match timeout(self.request_timeout, connection.exchange(&request)).await {
            Ok(Ok(response)) => {
                *slot = Some(connection);
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Transport(format!(
                "{} request timed out after {:?}",
                request.action(),
                self.request_timeout
            ))),
        }
    }

    async fn open_data_channel(&self, agent_id: &AgentId) -> Result<DataChannel> {
        let stream = TcpStream::connect(&self.message_addr).await.map_err(|e| {
            BusError::Transport(format!("cannot reach orchestrator at {}: {e}", self.message_addr))
        })?;
        let (mut lines, mut writer) = split(stream);

        write_line(&mut writer, &DataHello { agent_id: agent_id.clone() }).await?;
        let ack: Option<RegistrationResponse> = timeout(self.request_timeout, read_line(&mut lines))
            .await
            .map_err(|_| BusError::Transport("data channel handshake timed out".to_string()))??;
        match ack {
            Some(response) if response.is_success() => {}
            Some(response) => {
                return Err(BusError::RegistrationRejected(
                    response.error.unwrap_or_else(|| "data channel refused".to_string()),
                ))
            }
            None => return Err(BusError::Transport("data channel closed during handshake".to_string())),
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = mpsc::channel::<Frame>(self.inbound_buffer);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_line(&mut writer, &frame).await {
                    tracing::warn!(error = %e, "Data channel write failed");
                    break;
                }
            }
        });

        let reader_task = tokio::spawn(async move {
            loop {
                match read_line::<_, Frame>(&mut lines).await {
                    Ok(Some(frame)) => {
                        // a slow receive loop holds back the socket, not memory
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("Orchestrator closed the data channel");
                        break;
                    }
                    Err(BusError::Codec(e)) => {
                        tracing::warn!(error = %e, "Skipping undecodable frame");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Data channel read failed");
                        break;
                    }
                }
            }
        });

        self.writers.lock().await.push(writer_task);
        self.readers.lock().await.push(reader_task);
        tracing::debug!(agent_id = %agent_id.short(), addr = %self.message_addr, "Data channel open");
        Ok(DataChannel { outbound, inbound })
    }

    async fn close(&self) -> Result<()> {
        self.registration.lock().await.take();
        for reader in self.readers.lock().await.drain(..) {
            reader.abort();
        }
        // writers finish on their own once every outbound sender is gone
        for mut writer in self.writers.lock().await.drain(..) {
            if timeout(self.request_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        Ok(())
    }
}

/// Accept registration connections until shutdown
pub(crate) async fn serve_registration(
    listener: TcpListener,
    orchestrator: Orchestrator,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(registration_connection(stream, peer, orchestrator.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Registration accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Registration listener stopped");
}

async fn registration_connection(
    stream: TcpStream,
    peer: SocketAddr,
    orchestrator: Orchestrator,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut lines, mut writer) = split(stream);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };
        let response = match line {
            Ok(Some(line)) => match serde_json::from_str::<RegistrationRequest>(&line) {
                Ok(request) => orchestrator.handle_request(request).await,
                Err(e) => RegistrationResponse::failed(format!("Invalid request: {e}")),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Registration read failed");
                break;
            }
        };
        if let Err(e) = write_line(&mut writer, &response).await {
            tracing::warn!(%peer, error = %e, "Registration reply failed");
            break;
        }
    }
}

/// Accept data connections until shutdown. Inbound frames are tagged with the
/// sender identity and funnelled into `inbound`.
pub(crate) async fn serve_data(
    listener: TcpListener,
    orchestrator: Orchestrator,
    hub: Arc<ConnectionHub>,
    inbound: mpsc::Sender<(AgentId, Frame)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(data_connection(
                        stream,
                        peer,
                        orchestrator.clone(),
                        hub.clone(),
                        inbound.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Data accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Data listener stopped");
}

async fn data_connection(
    stream: TcpStream,
    peer: SocketAddr,
    orchestrator: Orchestrator,
    hub: Arc<ConnectionHub>,
    inbound: mpsc::Sender<(AgentId, Frame)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut lines, mut writer) = split(stream);
    let agent_id = match timeout(HANDSHAKE_TIMEOUT, read_line::<_, DataHello>(&mut lines)).await {
        Ok(Ok(Some(hello))) => hello.agent_id,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::warn!(%peer, error = %e, "Bad data channel hello");
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "Data channel hello timed out");
            return;
        }
    };

    if !orchestrator.is_registered(&agent_id).await {
        tracing::warn!(%peer, agent_id = %agent_id.short(), "Data channel for unregistered agent");
        let _ = write_line(&mut writer, &RegistrationResponse::failed("Agent not registered")).await;
        return;
    }

    let (peer_tx, mut peer_rx) = hub.peer_channel();
    hub.attach(agent_id.clone(), peer_tx.clone()).await;
    // acknowledged only once attached, so no routed frame can miss the peer
    if let Err(e) = write_line(&mut writer, &RegistrationResponse::success()).await {
        tracing::warn!(%peer, error = %e, "Data channel ack failed");
        hub.detach_channel(&agent_id, &peer_tx).await;
        return;
    }
    tracing::info!(%peer, agent_id = %agent_id.short(), "Data channel attached");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = peer_rx.recv().await {
            if let Err(e) = write_line(&mut writer, &frame).await {
                tracing::warn!(error = %e, "Frame delivery failed");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = read_line::<_, Frame>(&mut lines) => frame,
            _ = shutdown.changed() => break,
        };
        match frame {
            Ok(Some(frame)) => {
                if inbound.send((agent_id.clone(), frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(BusError::Codec(e)) => {
                tracing::warn!(agent_id = %agent_id.short(), error = %e, "Skipping undecodable frame");
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id.short(), error = %e, "Data channel read failed");
                break;
            }
        }
    }

    hub.detach_channel(&agent_id, &peer_tx).await;
    drop(peer_tx);
    writer_task.abort();
    tracing::debug!(%peer, agent_id = %agent_id.short(), "Data channel closed");
}
