//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──ws──► connection task A ──┐                     ┌──► outbox A ──► ws A
//!                                      ├─► RelayCommand ─► relay task ─┤
//! Client B ──ws──► connection task B ──┘      (mpsc)     Relay<ConnectionRegistry>
//!                                                                └──► outbox B ──► ws B
//! ```
//!
//! Connection tasks only move frames: they decode inbound `ClientEvent`s,
//! forward them to the relay task, and write whatever lands in their
//! outbox. The relay task owns all room state and runs one command at a
//! time, so no room operation ever interleaves with another.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ConnectionRegistry, Outbox};
use crate::protocol::{ClientEvent, ConnectionId, ProtocolError};
use crate::relay::Relay;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Volatile frames queued per connection before new ones are dropped
    pub volatile_capacity: usize,
    /// Inbound commands buffered ahead of the relay task
    pub command_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            volatile_capacity: 64,
            command_buffer: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl ServerConfig {
    /// Defaults overlaid with `VELLUM_BIND_ADDR`, `VELLUM_VOLATILE_CAPACITY`
    /// and `VELLUM_COMMAND_BUFFER` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = env::var("VELLUM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(capacity) = env::var("VELLUM_VOLATILE_CAPACITY") {
            config.volatile_capacity = capacity.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid volatile capacity: {e}"))
            })?;
        }
        if let Ok(buffer) = env::var("VELLUM_COMMAND_BUFFER") {
            config.command_buffer = buffer
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid command buffer: {e}")))?;
        }

        Ok(config)
    }

    /// Ephemeral port, small queues.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            volatile_capacity: 8,
            command_buffer: 64,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub relayed_messages: u64,
    pub dropped_volatile: u64,
    pub delivery_failures: u64,
    /// Frames handed to connection outboxes
    pub frames_sent: u64,
    /// Frames refused by a closed, congested or unknown outbox
    pub frames_dropped: u64,
}

/// Work for the relay task.
#[derive(Debug)]
pub(crate) enum RelayCommand {
    Connect {
        connection: ConnectionId,
        outbox: Outbox,
    },
    Inbound {
        connection: ConnectionId,
        event: ClientEvent,
    },
    Disconnect {
        connection: ConnectionId,
    },
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let (commands, command_rx) = mpsc::channel(self.config.command_buffer.max(1));
        tokio::spawn(run_relay(command_rx, self.stats.clone()));

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let commands = commands.clone();
            let stats = self.stats.clone();
            let volatile_capacity = self.config.volatile_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, commands, stats, volatile_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        commands: mpsc::Sender<RelayCommand>,
        stats: Arc<RwLock<ServerStats>>,
        volatile_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection = Uuid::new_v4();
        let (outbox, mut inbox) = Outbox::channel(volatile_capacity);
        commands
            .send(RelayCommand::Connect { connection, outbox })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("WebSocket connection {connection} established from {addr}");

        let session: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    biased;

                    Some(frame) = inbox.reliable.recv() => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }

                    Some(frame) = inbox.volatile.recv() => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }

                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientEvent::decode(&data) {
                                    Ok(event) => {
                                        let command = RelayCommand::Inbound { connection, event };
                                        if commands.send(command).await.is_err() {
                                            log::warn!("Relay task gone; closing {connection}");
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection} closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        let _ = commands.send(RelayCommand::Disconnect { connection }).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        session
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Drive the relay state machine until every command sender is gone.
async fn run_relay(mut commands: mpsc::Receiver<RelayCommand>, stats: Arc<RwLock<ServerStats>>) {
    let mut relay = Relay::new(ConnectionRegistry::new());

    while let Some(command) = commands.recv().await {
        match command {
            RelayCommand::Connect { connection, outbox } => {
                relay.transport_mut().register(connection, outbox);
                relay.connect(connection);
            }
            RelayCommand::Inbound { connection, event } => relay.handle(connection, event),
            RelayCommand::Disconnect { connection } => {
                relay.disconnect(connection);
                relay.transport_mut().unregister(&connection);
            }
        }

        let relay_stats = relay.stats();
        let mut s = stats.write().await;
        s.active_rooms = relay.room_count();
        s.relayed_messages = relay_stats.relayed;
        s.dropped_volatile = relay_stats.volatile_dropped;
        s.delivery_failures = relay_stats.delivery_failures;
        let frames = relay.transport().stats();
        s.frames_sent = frames.messages_sent;
        s.frames_dropped = frames.messages_dropped;
    }

    log::info!("Relay task stopped");
}
