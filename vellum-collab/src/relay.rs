//! Room and follow bookkeeping for the relay.
//!
//! ```text
//!            join / relay / follow / disconnect
//!  commands ───────────────────────────────────► Relay ──► Transport.send()
//!                                                  │
//!                     rooms:       room → {connection}
//!                     memberships: connection → {room}
//! ```
//!
//! A follow edge "A follows T" is A's membership in the room
//! `follow@<T>`. The relay never looks inside broadcast payloads, and
//! delivery failures are per recipient: they are logged and fan-out
//! continues.
//!
//! `Relay` is a plain state machine. The server drives it from a single
//! task, so every operation (including a join's signal-then-roster pair)
//! runs to completion before the next one starts.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::protocol::{
    ClientEvent, ConnectionId, EncryptedPayload, FollowAction, RoomId, ServerEvent,
};

pub const FOLLOW_ROOM_PREFIX: &str = "follow@";

/// Name of the room holding `target`'s followers.
pub fn follow_room(target: &ConnectionId) -> RoomId {
    format!("{FOLLOW_ROOM_PREFIX}{target}")
}

/// Target of a follow room, if `room` is one.
pub fn follow_target(room: &str) -> Option<ConnectionId> {
    room.strip_prefix(FOLLOW_ROOM_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued until written; never dropped while the peer is connected.
    Reliable,
    /// Dropped when the peer's queue is full or the peer is gone.
    Volatile,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} closed")]
    Closed(ConnectionId),
    #[error("connection {0} congested")]
    Congested(ConnectionId),
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

/// Outbound side of the relay.
pub trait Transport: Send {
    fn send(
        &self,
        to: &ConnectionId,
        event: &ServerEvent,
        delivery: Delivery,
    ) -> Result<(), TransportError>;

    /// Send one event to many recipients, returning the per-recipient failures.
    fn broadcast(
        &self,
        to: &[ConnectionId],
        event: &ServerEvent,
        delivery: Delivery,
    ) -> Vec<(ConnectionId, TransportError)> {
        to.iter()
            .filter_map(|id| self.send(id, event, delivery).err().map(|e| (*id, e)))
            .collect()
    }
}

/// Counters kept by the relay state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Broadcast payloads accepted for fan-out.
    pub relayed: u64,
    /// Volatile deliveries dropped.
    pub volatile_dropped: u64,
    /// Failed deliveries of every other kind.
    pub delivery_failures: u64,
}

pub struct Relay<T: Transport> {
    transport: T,
    rooms: HashMap<RoomId, BTreeSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, BTreeSet<RoomId>>,
    stats: RelayStats,
}

impl<T: Transport> Relay<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Register a connection and tell it its id.
    pub fn connect(&mut self, connection: ConnectionId) {
        self.memberships.entry(connection).or_default();
        self.send(
            &connection,
            &ServerEvent::InitRoom {
                connection_id: connection,
            },
            Delivery::Reliable,
        );
        log::debug!("connection {connection} registered");
    }

    pub fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.memberships.contains_key(connection)
    }

    /// Dispatch one inbound client event.
    pub fn handle(&mut self, from: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { room_id } => self.join(from, room_id),
            ClientEvent::ServerBroadcast { room_id, payload } => {
                self.relay(from, &room_id, payload, false)
            }
            ClientEvent::ServerVolatileBroadcast { room_id, payload } => {
                self.relay(from, &room_id, payload, true)
            }
            ClientEvent::UserFollow { target, action } => self.follow(from, target, action),
            ClientEvent::Ping => self.send(&from, &ServerEvent::Pong, Delivery::Reliable),
        }
    }

    /// Add `connection` to `room_id`.
    ///
    /// A lone joiner gets `FirstInRoom`; otherwise the existing members get
    /// `NewUser`. Either way the full roster then goes to everyone.
    ///
    /// Names under `follow@` are reserved for follow edges and only change
    /// through [`Relay::follow`]; joins into them are ignored.
    pub fn join(&mut self, connection: ConnectionId, room_id: RoomId) {
        if room_id.starts_with(FOLLOW_ROOM_PREFIX) {
            log::warn!("{connection} tried to join reserved room {room_id}; ignored");
            return;
        }
        log::info!("{connection} has joined {room_id}");
        let members = self.add_member(connection, room_id);

        if members.len() <= 1 {
            self.send(&connection, &ServerEvent::FirstInRoom, Delivery::Reliable);
        } else {
            let others: Vec<_> = members.iter().copied().filter(|m| *m != connection).collect();
            self.broadcast(
                &others,
                &ServerEvent::NewUser {
                    connection_id: connection,
                },
                Delivery::Reliable,
            );
        }

        self.broadcast(
            &members,
            &ServerEvent::RoomUserChange {
                members: members.clone(),
            },
            Delivery::Reliable,
        );
    }

    /// Forward a payload verbatim to every other member of `room_id`.
    pub fn relay(
        &mut self,
        from: ConnectionId,
        room_id: &str,
        payload: EncryptedPayload,
        volatile: bool,
    ) {
        let recipients: Vec<_> = self
            .rooms
            .get(room_id)
            .map(|m| m.iter().copied().filter(|id| *id != from).collect())
            .unwrap_or_default();

        self.stats.relayed += 1;
        if recipients.is_empty() {
            log::trace!("{from} broadcast to {room_id} with no other members");
            return;
        }

        let delivery = if volatile {
            Delivery::Volatile
        } else {
            Delivery::Reliable
        };
        log::trace!(
            "{from} → {room_id}: {} bytes to {} peers ({delivery:?})",
            payload.ciphertext.len(),
            recipients.len()
        );
        self.broadcast(&recipients, &ServerEvent::ClientBroadcast { payload }, delivery);
    }

    /// Start or stop following `target`, then send `target` its follower list.
    pub fn follow(&mut self, follower: ConnectionId, target: ConnectionId, action: FollowAction) {
        let room = follow_room(&target);
        match action {
            FollowAction::Follow => {
                self.add_member(follower, room.clone());
            }
            FollowAction::Unfollow => {
                self.remove_member(&follower, &room);
            }
        }
        log::debug!("{follower} {action:?} {target}");

        let followers = self.members(&room);
        self.send(
            &target,
            &ServerEvent::UserFollowRoomChange { followers },
            Delivery::Reliable,
        );
    }

    /// Remove `connection` from every room and notify whoever is affected.
    pub fn disconnect(&mut self, connection: ConnectionId) {
        let rooms = self.memberships.remove(&connection).unwrap_or_default();
        log::info!("{connection} disconnected from {} rooms", rooms.len());

        for room in rooms {
            let remaining = self.detach(&connection, &room);
            match follow_target(&room) {
                Some(target) if remaining.is_empty() => {
                    self.send(&target, &ServerEvent::BroadcastUnfollow, Delivery::Reliable);
                }
                Some(target) => {
                    self.send(
                        &target,
                        &ServerEvent::UserFollowRoomChange {
                            followers: remaining,
                        },
                        Delivery::Reliable,
                    );
                }
                None if !remaining.is_empty() => {
                    self.broadcast(
                        &remaining,
                        &ServerEvent::RoomUserChange { members: remaining.clone() },
                        Delivery::Reliable,
                    );
                }
                None => {}
            }
        }

        // A departed target has nobody left to notify; dissolve its follow room.
        let own_room = follow_room(&connection);
        if let Some(followers) = self.rooms.remove(&own_room) {
            for follower in followers {
                if let Some(rooms) = self.memberships.get_mut(&follower) {
                    rooms.remove(&own_room);
                }
            }
        }
    }

    /// Current members of a room, in id order.
    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn followers_of(&self, target: &ConnectionId) -> Vec<ConnectionId> {
        self.members(&follow_room(target))
    }

    pub fn rooms_of(&self, connection: &ConnectionId) -> Vec<RoomId> {
        self.memberships
            .get(connection)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }

    fn add_member(&mut self, connection: ConnectionId, room_id: RoomId) -> Vec<ConnectionId> {
        self.memberships
            .entry(connection)
            .or_default()
            .insert(room_id.clone());
        let members = self.rooms.entry(room_id).or_default();
        members.insert(connection);
        members.iter().copied().collect()
    }

    fn remove_member(&mut self, connection: &ConnectionId, room_id: &str) {
        if let Some(rooms) = self.memberships.get_mut(connection) {
            rooms.remove(room_id);
        }
        self.detach(connection, room_id);
    }

    /// Drop `connection` from the room's member set and return who is left.
    /// Empty rooms are destroyed.
    fn detach(&mut self, connection: &ConnectionId, room_id: &str) -> Vec<ConnectionId> {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        members.remove(connection);
        if members.is_empty() {
            self.rooms.remove(room_id);
            log::debug!("room {room_id} closed");
            return Vec::new();
        }
        members.iter().copied().collect()
    }

    fn send(&mut self, to: &ConnectionId, event: &ServerEvent, delivery: Delivery) {
        if let Err(e) = self.transport.send(to, event, delivery) {
            self.record_failure(to, &e, delivery);
        }
    }

    fn broadcast(&mut self, to: &[ConnectionId], event: &ServerEvent, delivery: Delivery) {
        for (id, e) in self.transport.broadcast(to, event, delivery) {
            self.record_failure(&id, &e, delivery);
        }
    }

    fn record_failure(&mut self, to: &ConnectionId, error: &TransportError, delivery: Delivery) {
        match delivery {
            Delivery::Volatile => {
                self.stats.volatile_dropped += 1;
                log::debug!("volatile frame to {to} dropped: {error}");
            }
            Delivery::Reliable => {
                self.stats.delivery_failures += 1;
                log::warn!("delivery to {to} failed: {error}");
            }
        }
    }
}
