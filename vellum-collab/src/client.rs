//! WebSocket relay client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) against one room
//! - Sealing outgoing [`ScenePayload`]s and opening incoming ones
//! - Follow / unfollow requests and heartbeats
//! - Offline queue for reliable payloads produced while disconnected
//!
//! The room secret never leaves this struct: the relay only ever sees
//! ciphertext.

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::codec::{CodecError, PayloadCipher};
use crate::payload::ScenePayload;
use crate::protocol::{
    ClientEvent, ConnectionId, EncryptedPayload, FollowAction, ProtocolError, RoomId, ServerEvent,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Socket open and room join sent
    Connected,
    /// Socket closed
    Disconnected,
    /// The relay told us our connection id
    Init { connection_id: ConnectionId },
    /// We are alone in the room
    FirstInRoom,
    NewUser(ConnectionId),
    RoomUserChange(Vec<ConnectionId>),
    /// A peer's payload, authenticated and parsed
    RemoteScene(ScenePayload),
    /// A peer's payload failed to open; it was discarded
    PayloadRejected(CodecError),
    /// Who follows us now
    FollowersChanged(Vec<ConnectionId>),
    /// Our last follower left
    BroadcastUnfollow,
    Pong,
}

/// Offline queue for reliable payloads sealed while disconnected.
///
/// Queued payloads are replayed, in order, on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<EncryptedPayload>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a payload for later replay. Returns false when full.
    pub fn enqueue(&mut self, payload: EncryptedPayload) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    pub fn drain(&mut self) -> Vec<EncryptedPayload> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total ciphertext bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|p| p.ciphertext.len()).sum()
    }
}

/// The relay client.
pub struct RelayClient {
    room_id: RoomId,
    cipher: PayloadCipher,
    state: Arc<RwLock<ConnectionState>>,
    connection_id: Arc<RwLock<Option<ConnectionId>>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    event_tx: mpsc::Sender<RelayEvent>,
    server_url: String,
}

impl RelayClient {
    /// Create a client for `room_id`, encrypting with a key derived from `secret`.
    pub fn new(server_url: impl Into<String>, room_id: impl Into<RoomId>, secret: &str) -> Self {
        Self::with_cipher(server_url, room_id, PayloadCipher::new(secret))
    }

    /// Create a client sharing an already-derived cipher.
    pub fn with_cipher(
        server_url: impl Into<String>,
        room_id: impl Into<RoomId>,
        cipher: PayloadCipher,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            room_id: room_id.into(),
            cipher,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the room and replay anything queued offline.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);
        self.join_room().await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued payloads into {}", queued.len(), self.room_id);
            let mut queued = queued.into_iter();
            while let Some(payload) = queued.next() {
                let event = ClientEvent::ServerBroadcast {
                    room_id: self.room_id.clone(),
                    payload: payload.clone(),
                };
                if let Err(e) = self.push(event).await {
                    // Keep the unsent tail for the next connect
                    let mut queue = self.offline_queue.lock().await;
                    for rest in std::iter::once(payload).chain(queued) {
                        queue.enqueue(rest);
                    }
                    return Err(e);
                }
            }
        }

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        let cipher = self.cipher.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let event = match ServerEvent::decode(&data) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Dropping undecodable server frame: {e}");
                                continue;
                            }
                        };
                        if let ServerEvent::InitRoom { connection_id: id } = &event {
                            *connection_id.write().await = Some(*id);
                        }
                        if event_tx.send(Self::translate(&cipher, event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            *connection_id.write().await = None;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send `JoinRoom` over a fresh writer; on failure fall back to disconnected.
    async fn join_room(&mut self) -> Result<(), ProtocolError> {
        let join = ClientEvent::JoinRoom {
            room_id: self.room_id.clone(),
        };
        if let Err(e) = self.push(join).await {
            log::warn!("Join of {} failed: {e}", self.room_id);
            self.outgoing_tx = None;
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }
        Ok(())
    }

    fn translate(cipher: &PayloadCipher, event: ServerEvent) -> RelayEvent {
        match event {
            ServerEvent::InitRoom { connection_id } => RelayEvent::Init { connection_id },
            ServerEvent::FirstInRoom => RelayEvent::FirstInRoom,
            ServerEvent::NewUser { connection_id } => RelayEvent::NewUser(connection_id),
            ServerEvent::RoomUserChange { members } => RelayEvent::RoomUserChange(members),
            ServerEvent::ClientBroadcast { payload } => match ScenePayload::open(cipher, &payload) {
                Ok(scene) => RelayEvent::RemoteScene(scene),
                Err(e) => {
                    log::warn!("Discarding remote payload: {e}");
                    RelayEvent::PayloadRejected(e)
                }
            },
            ServerEvent::UserFollowRoomChange { followers } => {
                RelayEvent::FollowersChanged(followers)
            }
            ServerEvent::BroadcastUnfollow => RelayEvent::BroadcastUnfollow,
            ServerEvent::Pong => RelayEvent::Pong,
        }
    }

    /// Close the socket. Queued offline payloads are kept.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer, which closes the socket
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Seal and send a payload to the room.
    ///
    /// Scene updates go reliable and are queued while offline, including
    /// when the socket drops mid-send. Pointer and idle signals go volatile
    /// and are dropped while offline.
    pub async fn send(&self, payload: &ScenePayload) -> Result<(), ProtocolError> {
        let sealed = payload.seal(&self.cipher)?;
        let volatile = payload.is_volatile();

        if *self.state.read().await != ConnectionState::Connected {
            return if volatile { Ok(()) } else { self.queue_offline(sealed).await };
        }

        let room_id = self.room_id.clone();
        if volatile {
            let event = ClientEvent::ServerVolatileBroadcast {
                room_id,
                payload: sealed,
            };
            return match self.push(event).await {
                Err(ProtocolError::ConnectionClosed) => Ok(()),
                other => other,
            };
        }

        let event = ClientEvent::ServerBroadcast {
            room_id,
            payload: sealed.clone(),
        };
        match self.push(event).await {
            Err(ProtocolError::ConnectionClosed) => {
                log::debug!("Socket closed while sending to {}; queueing", self.room_id);
                self.queue_offline(sealed).await
            }
            other => other,
        }
    }

    async fn queue_offline(&self, sealed: EncryptedPayload) -> Result<(), ProtocolError> {
        if self.offline_queue.lock().await.enqueue(sealed) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Follow or unfollow another connection.
    pub async fn follow(&self, target: ConnectionId, action: FollowAction) -> Result<(), ProtocolError> {
        self.push(ClientEvent::UserFollow { target, action }).await
    }

    /// Send a ping to the relay.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.push(ClientEvent::Ping).await
    }

    async fn push(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        let encoded = event.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Id the relay assigned, once `Init` has arrived.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection_id.read().await
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn cipher(&self) -> &PayloadCipher {
        &self.cipher
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
