//! Per-connection outboxes: the relay's concrete [`Transport`].
//!
//! Each connection owns two queues drained by its writer task:
//! - reliable: unbounded, so nothing is dropped while the peer is connected
//! - volatile: bounded; a full queue drops the frame immediately
//!
//! Frames are encoded once per event and shared as `Arc<Vec<u8>>`, so a
//! fan-out to N peers costs one serialization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::{ConnectionId, ServerEvent};
use crate::relay::{Delivery, Transport, TransportError};

/// An encoded server frame.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Frame counters, bumped through `&self` from `Transport::send`.
#[derive(Debug, Default)]
struct FrameCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Sending half of a connection's queues. Held by the registry.
#[derive(Debug, Clone)]
pub struct Outbox {
    reliable: mpsc::UnboundedSender<Frame>,
    volatile: mpsc::Sender<Frame>,
}

/// Receiving half of a connection's queues. Held by the writer task.
#[derive(Debug)]
pub struct Inbox {
    pub reliable: mpsc::UnboundedReceiver<Frame>,
    pub volatile: mpsc::Receiver<Frame>,
}

impl Outbox {
    /// Create a queue pair whose volatile side holds at most `volatile_capacity` frames.
    pub fn channel(volatile_capacity: usize) -> (Outbox, Inbox) {
        let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
        let (volatile_tx, volatile_rx) = mpsc::channel(volatile_capacity.max(1));
        (
            Outbox {
                reliable: reliable_tx,
                volatile: volatile_tx,
            },
            Inbox {
                reliable: reliable_rx,
                volatile: volatile_rx,
            },
        )
    }

    fn push(&self, to: &ConnectionId, frame: Frame, delivery: Delivery) -> Result<(), TransportError> {
        match delivery {
            Delivery::Reliable => self
                .reliable
                .send(frame)
                .map_err(|_| TransportError::Closed(*to)),
            Delivery::Volatile => self.volatile.try_send(frame).map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Congested(*to),
                TrySendError::Closed(_) => TransportError::Closed(*to),
            }),
        }
    }
}

/// Connection id → outbox map.
///
/// Owned by the relay task; connections are added and removed through
/// `Relay::transport_mut`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    outboxes: HashMap<ConnectionId, Outbox>,
    counters: FrameCounters,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connection: ConnectionId, outbox: Outbox) {
        self.outboxes.insert(connection, outbox);
    }

    /// Forget a connection. Dropping its outbox ends the writer's queues.
    pub fn unregister(&mut self, connection: &ConnectionId) -> bool {
        self.outboxes.remove(connection).is_some()
    }

    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.outboxes.contains_key(connection)
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            active_connections: self.outboxes.len(),
        }
    }

    fn deliver(&self, to: &ConnectionId, frame: Frame, delivery: Delivery) -> Result<(), TransportError> {
        let result = match self.outboxes.get(to) {
            Some(outbox) => outbox.push(to, frame, delivery),
            None => Err(TransportError::UnknownConnection(*to)),
        };
        let counter = match result {
            Ok(()) => &self.counters.sent,
            Err(_) => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }
}

fn encode(event: &ServerEvent) -> Result<Frame, TransportError> {
    event
        .encode()
        .map(Arc::new)
        .map_err(|e| TransportError::Encode(e.to_string()))
}

impl Transport for ConnectionRegistry {
    fn send(
        &self,
        to: &ConnectionId,
        event: &ServerEvent,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        self.deliver(to, encode(event)?, delivery)
    }

    fn broadcast(
        &self,
        to: &[ConnectionId],
        event: &ServerEvent,
        delivery: Delivery,
    ) -> Vec<(ConnectionId, TransportError)> {
        let frame = match encode(event) {
            Ok(frame) => frame,
            Err(e) => return to.iter().map(|id| (*id, e.clone())).collect(),
        };
        to.iter()
            .filter_map(|id| {
                self.deliver(id, Arc::clone(&frame), delivery)
                    .err()
                    .map(|e| (*id, e))
            })
            .collect()
    }
}
