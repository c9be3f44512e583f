//! # vellum-collab — Real-time relay, payload encryption and object reconciliation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ServerBroadcast(ciphertext)   ┌──────────────┐
//! │ RelayClient  │ ──────────────────────────────► │ RelayServer  │
//! │ PayloadCipher│ ◄────────────────────────────── │ Relay<T>     │
//! └──────┬───────┘   ClientBroadcast(ciphertext)   └──────┬───────┘
//!        │ ScenePayload                                   │ rooms / follow@<id>
//!        ▼                                                ▼
//!   Delta Renderer                               ConnectionRegistry
//!   (vellum-render)                              (reliable + volatile outboxes)
//!
//! ┌──────────────┐  fetch_live_ids / mark_deleted / upsert  ┌──────────────────┐
//! │ Reconciler   │ ───────────────────────────────────────► │ ObjectStore      │
//! └──────────────┘                                          │ Memory │ RocksDB │
//!                                                           └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded client/server events)
//! - [`codec`] — PBKDF2 key derivation and AES-128-GCM sealing
//! - [`payload`] — Typed plaintext carried inside encrypted broadcasts
//! - [`relay`] — Room and follow state machine over a `Transport`
//! - [`broadcast`] — Per-connection outboxes implementing `Transport`
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket relay client with offline queue
//! - [`reconcile`] — Snapshot reconciliation against an `ObjectStore`
//! - [`storage`] — In-memory and RocksDB object stores

pub mod protocol;
pub mod codec;
pub mod payload;
pub mod relay;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod reconcile;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, ConnectionId, EncryptedPayload, FollowAction, ProtocolError, RoomId,
    ServerEvent, IV_LEN,
};
pub use codec::{
    decrypt, derive_key, encrypt, generate_room_key, CodecError, EncryptionKey, PayloadCipher,
};
pub use payload::{PointerButton, ScenePayload, UserIdleState};
pub use relay::{
    follow_room, follow_target, Delivery, Relay, RelayStats, Transport, TransportError,
    FOLLOW_ROOM_PREFIX,
};
pub use broadcast::{BroadcastStats, ConnectionRegistry, Inbox, Outbox};
pub use server::{ConfigError, RelayServer, ServerConfig, ServerStats};
pub use client::{ConnectionState, OfflineQueue, RelayClient, RelayEvent};
pub use reconcile::{ReconcileConfig, Reconciler, SyncPlan, SyncReport};
pub use storage::{
    MemoryObjectStore, ObjectStore, PersistenceError, RocksObjectStore, StoreConfig,
    UpsertOutcome,
};
