//! Local fan-out capability.
//!
//! The relay never talks to sockets itself. Each adapter hands events to a
//! `LocalBroadcaster`, which knows the namespace's sockets and rooms.
//! `RoomBroadcaster` is a small in-memory implementation of that contract.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::codec::Payload;
use crate::record::DeliveryOptions;

/// Where an event handed to the local broadcaster came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrigin {
    /// Broadcast by this process.
    Local,
    /// Received over the relay from another process.
    Remote,
}

/// Delivers an event to the sockets of one namespace in this process.
///
/// Called synchronously on the broadcasting path; implementations must not
/// block on I/O.
pub trait LocalBroadcaster: Send + Sync {
    fn broadcast(
        &self,
        namespace: &str,
        packet: &Payload,
        options: &DeliveryOptions,
        origin: DeliveryOrigin,
    );
}

/// One call made to a broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastCall {
    pub namespace: String,
    pub packet: Payload,
    pub options: DeliveryOptions,
    pub origin: DeliveryOrigin,
}

#[derive(Default)]
struct Rooms {
    /// namespace -> socket -> joined rooms
    sockets: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// socket -> received packets
    inboxes: BTreeMap<String, Vec<(Payload, DeliveryOrigin)>>,
    calls: Vec<BroadcastCall>,
}

/// In-memory socket/room registry implementing `LocalBroadcaster`.
///
/// `rooms: None` reaches every socket of the namespace; `rooms: Some(set)`
/// reaches sockets in at least one of the rooms, so an empty set reaches no
/// one. Sockets in any `except` room are skipped.
#[derive(Default)]
pub struct RoomBroadcaster {
    state: Mutex<Rooms>,
}

impl RoomBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Rooms> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a socket in a namespace. The socket joins a room named after itself.
    pub fn connect(&self, namespace: &str, socket: &str) {
        let mut state = self.state();
        state
            .sockets
            .entry(namespace.to_string())
            .or_default()
            .entry(socket.to_string())
            .or_default()
            .insert(socket.to_string());
        state.inboxes.entry(socket.to_string()).or_default();
    }

    /// Add a socket to a room, connecting it first if needed.
    pub fn join(&self, namespace: &str, socket: &str, room: &str) {
        self.connect(namespace, socket);
        let mut state = self.state();
        if let Some(rooms) = state
            .sockets
            .get_mut(namespace)
            .and_then(|sockets| sockets.get_mut(socket))
        {
            rooms.insert(room.to_string());
        }
    }

    pub fn leave(&self, namespace: &str, socket: &str, room: &str) {
        let mut state = self.state();
        if let Some(rooms) = state
            .sockets
            .get_mut(namespace)
            .and_then(|sockets| sockets.get_mut(socket))
        {
            rooms.remove(room);
        }
    }

    /// Packets delivered to a socket, oldest first.
    pub fn received(&self, socket: &str) -> Vec<Payload> {
        self.deliveries(socket)
            .into_iter()
            .map(|(packet, _)| packet)
            .collect()
    }

    pub fn deliveries(&self, socket: &str) -> Vec<(Payload, DeliveryOrigin)> {
        self.state()
            .inboxes
            .get(socket)
            .cloned()
            .unwrap_or_default()
    }

    /// Every broadcast call, in call order.
    pub fn calls(&self) -> Vec<BroadcastCall> {
        self.state().calls.clone()
    }
}

impl LocalBroadcaster for RoomBroadcaster {
    fn broadcast(
        &self,
        namespace: &str,
        packet: &Payload,
        options: &DeliveryOptions,
        origin: DeliveryOrigin,
    ) {
        let mut state = self.state();
        state.calls.push(BroadcastCall {
            namespace: namespace.to_string(),
            packet: packet.clone(),
            options: options.clone(),
            origin,
        });

        let targets: Vec<String> = state
            .sockets
            .get(namespace)
            .map(|sockets| {
                sockets
                    .iter()
                    .filter(|(_, joined)| match &options.rooms {
                        None => true,
                        Some(rooms) => !joined.is_disjoint(rooms),
                    })
                    .filter(|(_, joined)| joined.is_disjoint(&options.except))
                    .map(|(socket, _)| socket.clone())
                    .collect()
            })
            .unwrap_or_default();

        for socket in targets {
            state
                .inboxes
                .entry(socket)
                .or_default()
                .push((packet.clone(), origin));
        }
    }
}
