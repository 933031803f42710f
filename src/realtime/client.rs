//! Low-level realtime websocket client.
//!
//! The connection is created lazily on the first subscribe and owned by a
//! background worker that handles heartbeats and automatic reconnects,
//! replaying channel interest after each reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::realtime::proto::{doc_channel, doctype_channel, ClientMessage, ServerMessage};
use crate::realtime::registry::{ChannelRegistry, EventCallback, Subscription};

const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Entry point for realtime channel subscriptions.
///
/// One instance per [`FrappeClient`](crate::FrappeClient); the connection is
/// a lazy singleton guarded by an async mutex, cleared by
/// [`disconnect`](RealtimeClient::disconnect) so a later subscribe opens a
/// fresh connection.
pub struct RealtimeClient {
    endpoint: String,
    registry: Arc<ChannelRegistry>,
    connection: Mutex<Option<Connection>>,
    generation_counter: AtomicU64,
}

struct Connection {
    commands: mpsc::UnboundedSender<ClientMessage>,
    // Dropping this wakes the worker and shuts the socket down. The command
    // queue cannot signal shutdown: subscription handles hold sender clones.
    shutdown: oneshot::Sender<()>,
    generation: u64,
}

impl RealtimeClient {
    /// Creates a client for an explicit websocket endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            registry: Arc::new(ChannelRegistry::default()),
            connection: Mutex::new(None),
            generation_counter: AtomicU64::new(0),
        }
    }

    /// The websocket endpoint this client connects to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribes to updates for one document (`doc:<doctype>:<name>`) or,
    /// when `name` is `None`, for the whole doctype (`doctype:<doctype>`).
    pub async fn subscribe_doc<F>(
        &self,
        doctype: &str,
        name: Option<&str>,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let channel = match name {
            Some(name) => doc_channel(doctype, name),
            None => doctype_channel(doctype),
        };
        self.subscribe_channel(channel, Arc::new(callback)).await
    }

    /// Subscribes to an explicitly named room.
    pub async fn subscribe_room<F>(
        &self,
        room: &str,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_channel(room.to_string(), Arc::new(callback))
            .await
    }

    async fn subscribe_channel(
        &self,
        channel: String,
        callback: EventCallback,
    ) -> Result<Subscription, RealtimeError> {
        let commands = self.ensure_connected().await?;
        let id = self.registry.register(channel.clone(), callback);

        let subscribe = ClientMessage::Subscribe {
            channel: channel.clone(),
        };
        if commands.send(subscribe).is_err() {
            self.registry.deregister(&channel, id);
            return Err(RealtimeError::SendQueueClosed);
        }

        Ok(Subscription::new(
            Arc::clone(&self.registry),
            commands,
            channel,
            id,
        ))
    }

    /// Closes the connection and clears the lazily-created handle.
    ///
    /// Idempotent; a no-op when nothing is connected. All registrations are
    /// dropped, so the next subscribe starts from a clean connection.
    pub async fn disconnect(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            // Dropping the shutdown sender wakes the worker; it closes the
            // socket and exits even while outstanding subscription handles
            // keep the command queue open.
            drop(connection);
        }
        self.registry.clear();
    }

    /// Generation number of the active connection, if any.
    ///
    /// Each fresh connection created after a [`disconnect`] carries a new
    /// generation, which makes "same handle vs fresh handle" observable.
    pub async fn generation(&self) -> Option<u64> {
        let guard = self.connection.lock().await;
        guard
            .as_ref()
            .filter(|connection| !connection.shutdown.is_closed())
            .map(|connection| connection.generation)
    }

    /// Whether a live connection worker exists.
    pub async fn is_connected(&self) -> bool {
        self.generation().await.is_some()
    }

    async fn ensure_connected(
        &self,
    ) -> Result<mpsc::UnboundedSender<ClientMessage>, RealtimeError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if !connection.shutdown.is_closed() {
                return Ok(connection.commands.clone());
            }
        }

        let (commands, shutdown) =
            spawn_worker(self.endpoint.clone(), Arc::clone(&self.registry)).await?;
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        *guard = Some(Connection {
            commands: commands.clone(),
            shutdown,
            generation,
        });
        Ok(commands)
    }
}

/// Errors produced by realtime transport and protocol handling.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound command queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// Realtime protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

async fn spawn_worker(
    endpoint: String,
    registry: Arc<ChannelRegistry>,
) -> Result<(mpsc::UnboundedSender<ClientMessage>, oneshot::Sender<()>), RealtimeError> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        connection_worker(endpoint, registry, commands_rx, shutdown_rx, ready_tx).await;
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok((commands_tx, shutdown_tx)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(RealtimeError::Protocol(
            "realtime worker stopped before initial connect".to_string(),
        )),
    }
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

async fn connection_worker(
    endpoint: String,
    registry: Arc<ChannelRegistry>,
    mut commands_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut pending = VecDeque::new();
    let mut backoff = MIN_RECONNECT_BACKOFF;

    loop {
        match run_connected_session(
            &endpoint,
            &registry,
            &mut commands_rx,
            &mut shutdown_rx,
            &mut pending,
            &mut ready_tx,
        )
        .await
        {
            Ok(SessionOutcome::GracefulShutdown) => break,
            Ok(SessionOutcome::Reconnect) => {
                debug!(event = "realtime_reconnect", endpoint = %endpoint);
                backoff = MIN_RECONNECT_BACKOFF;
            }
            Err(err) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
                warn!(event = "realtime_session_failed", error = %err);
            }
        }

        if commands_rx.is_closed() {
            break;
        }

        if !collect_commands_during_delay(backoff, &mut commands_rx, &mut shutdown_rx, &mut pending)
            .await
        {
            break;
        }

        backoff = std::cmp::min(backoff.saturating_mul(2), MAX_RECONNECT_BACKOFF);
    }
}

async fn run_connected_session(
    endpoint: &str,
    registry: &ChannelRegistry,
    commands_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    pending: &mut VecDeque<ClientMessage>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), RealtimeError>>>,
) -> Result<SessionOutcome, RealtimeError> {
    let (mut socket, _) = connect_async(endpoint).await?;

    // Shutdown may have been requested while the connect was in flight; a
    // dying worker must not replay interest for channels the registry now
    // holds for a successor connection.
    if shutdown_requested(shutdown_rx) {
        let _ = socket.close(None).await;
        return Ok(SessionOutcome::GracefulShutdown);
    }

    // Replay interest for every channel that is still registered, so
    // subscriptions survive transport-level reconnects.
    for channel in registry.channel_names() {
        send_client_message(&mut socket, &ClientMessage::Subscribe { channel }).await?;
    }

    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    }

    while let Some(next) = pending.pop_front() {
        if send_client_message(&mut socket, &next).await.is_err() {
            pending.push_front(next);
            return Ok(SessionOutcome::Reconnect);
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            biased;

            _ = &mut *shutdown_rx => {
                let _ = socket.close(None).await;
                return Ok(SessionOutcome::GracefulShutdown);
            }
            maybe_command = commands_rx.recv() => {
                match maybe_command {
                    Some(command) => {
                        if send_client_message(&mut socket, &command).await.is_err() {
                            pending.push_front(command);
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(SessionOutcome::GracefulShutdown);
                    }
                }
            }
            _ = heartbeat.tick() => {
                let ping = ClientMessage::Ping { client_time_ms: now_ms() };
                if send_client_message(&mut socket, &ping).await.is_err() {
                    return Ok(SessionOutcome::Reconnect);
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::from_text(&text) {
                            Ok(message) => apply_server_message(registry, message),
                            Err(_) => return Ok(SessionOutcome::Reconnect),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(SessionOutcome::Reconnect),
                    Some(Ok(_)) => return Ok(SessionOutcome::Reconnect),
                    Some(Err(_)) => return Ok(SessionOutcome::Reconnect),
                    None => return Ok(SessionOutcome::Reconnect),
                }
            }
        }
    }
}

fn apply_server_message(registry: &ChannelRegistry, message: ServerMessage) {
    match message {
        ServerMessage::Event { channel, payload } => registry.dispatch(&channel, &payload),
        ServerMessage::Pong { server_time_ms } => {
            debug!(event = "realtime_pong", server_time_ms);
        }
        ServerMessage::Error { code, message } => {
            warn!(event = "realtime_server_error", code = %code, message = %message);
        }
    }
}

async fn send_client_message(
    socket: &mut Socket,
    message: &ClientMessage,
) -> Result<(), RealtimeError> {
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn collect_commands_during_delay(
    delay: Duration,
    commands_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    pending: &mut VecDeque<ClientMessage>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            _ = &mut *shutdown_rx => return false,
            _ = &mut sleep => return true,
            maybe_command = commands_rx.recv() => {
                match maybe_command {
                    Some(command) => pending.push_back(command),
                    None => return false,
                }
            }
        }
    }
}

fn shutdown_requested(shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
