//! Deferred event delivery from I/O tasks to the application thread.
//!
//! Receive tasks never call application code. They push [`ClientEvent`]s or
//! [`ServerEvent`]s into an [`EventBuffer`]; the application drains it once
//! per tick through `fire_events`, which runs handlers synchronously on the
//! caller's thread in push order.

use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::server::ConnectionId;

/// Multi-producer, single-consumer FIFO of pending events.
///
/// Cloning is not offered; producers get a [`EventSender`] instead.
pub struct EventBuffer<E> {
    tx: Sender<E>,
    rx: Receiver<E>,
}

/// Producer half of an [`EventBuffer`], handed to background tasks.
pub struct EventSender<E> {
    tx: Sender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSender<E> {
    /// Queue an event. Never blocks.
    pub fn push(&self, event: E) {
        // The buffer owns a receiver for as long as any sender can reach it.
        let _ = self.tx.send(event);
    }
}

impl<E> EventBuffer<E> {
    /// Create an empty, unbounded buffer.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// A producer handle for this buffer.
    pub fn sender(&self) -> EventSender<E> {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Queue an event from the owning side.
    pub fn push(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Take every event pushed before this call, oldest first.
    ///
    /// Events pushed while the returned batch is being handled stay queued
    /// for the next drain.
    pub fn drain(&self) -> Vec<E> {
        let pending = self.rx.len();
        self.rx.try_iter().take(pending).collect()
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that happened on a client session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<S> {
    /// A packet arrived on the reliable channel.
    Packet(S),
    /// A datagram arrived on the attached UDP channel.
    UnreliablePacket(S),
    /// The session is gone and will not come back without a new `connect`.
    ConnectionLost,
    /// A broken transport was replaced by a fresh one.
    ConnectionRepaired {
        /// Time between detecting the fault and the repaired heartbeat.
        transition: Duration,
    },
}

/// Something that happened on the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent<C> {
    /// A packet arrived from a registered client.
    Packet {
        /// Sender.
        id: ConnectionId,
        /// Decoded packet.
        packet: C,
    },
    /// A datagram attributed to a registered client.
    UnreliablePacket {
        /// Sender.
        id: ConnectionId,
        /// Decoded packet.
        packet: C,
    },
    /// A client passed the handshake and was registered.
    ClientConnected {
        /// Assigned identifier.
        id: ConnectionId,
        /// Remote endpoint.
        addr: SocketAddr,
    },
    /// A client closed its connection.
    ClientDisconnected {
        /// Former identifier.
        id: ConnectionId,
    },
    /// A client was evicted after a transport fault or failed heartbeat.
    ConnectionLost {
        /// Former identifier.
        id: ConnectionId,
    },
}

/// Application callbacks for a client session. Every method defaults to a
/// no-op so implementors only override what they need.
pub trait ClientHandler<S> {
    /// A reliable packet arrived.
    fn on_packet(&mut self, _packet: S) {}
    /// An unreliable packet arrived.
    fn on_unreliable_packet(&mut self, _packet: S) {}
    /// The connection was lost.
    fn on_connection_lost(&mut self) {}
    /// The connection was repaired.
    fn on_connection_repaired(&mut self, _transition: Duration) {}
}

/// Closures receive the raw event.
impl<S, F> ClientHandler<S> for F
where
    F: FnMut(ClientEvent<S>),
{
    fn on_packet(&mut self, packet: S) {
        self(ClientEvent::Packet(packet));
    }

    fn on_unreliable_packet(&mut self, packet: S) {
        self(ClientEvent::UnreliablePacket(packet));
    }

    fn on_connection_lost(&mut self) {
        self(ClientEvent::ConnectionLost);
    }

    fn on_connection_repaired(&mut self, transition: Duration) {
        self(ClientEvent::ConnectionRepaired { transition });
    }
}

/// Application callbacks for a server.
pub trait ServerHandler<C> {
    /// A reliable packet arrived from `id`.
    fn on_packet(&mut self, _id: ConnectionId, _packet: C) {}
    /// An unreliable packet arrived from `id`.
    fn on_unreliable_packet(&mut self, _id: ConnectionId, _packet: C) {}
    /// A client was registered.
    fn on_client_connected(&mut self, _id: ConnectionId, _addr: SocketAddr) {}
    /// A client closed its connection.
    fn on_client_disconnected(&mut self, _id: ConnectionId) {}
    /// A client was evicted.
    fn on_connection_lost(&mut self, _id: ConnectionId) {}
}

impl<C, F> ServerHandler<C> for F
where
    F: FnMut(ServerEvent<C>),
{
    fn on_packet(&mut self, id: ConnectionId, packet: C) {
        self(ServerEvent::Packet { id, packet });
    }

    fn on_unreliable_packet(&mut self, id: ConnectionId, packet: C) {
        self(ServerEvent::UnreliablePacket { id, packet });
    }

    fn on_client_connected(&mut self, id: ConnectionId, addr: SocketAddr) {
        self(ServerEvent::ClientConnected { id, addr });
    }

    fn on_client_disconnected(&mut self, id: ConnectionId) {
        self(ServerEvent::ClientDisconnected { id });
    }

    fn on_connection_lost(&mut self, id: ConnectionId) {
        self(ServerEvent::ConnectionLost { id });
    }
}

impl<S> ClientEvent<S> {
    /// Invoke the matching handler method.
    pub fn dispatch<H: ClientHandler<S> + ?Sized>(self, handler: &mut H) {
        match self {
            ClientEvent::Packet(packet) => handler.on_packet(packet),
            ClientEvent::UnreliablePacket(packet) => handler.on_unreliable_packet(packet),
            ClientEvent::ConnectionLost => handler.on_connection_lost(),
            ClientEvent::ConnectionRepaired { transition } => {
                handler.on_connection_repaired(transition)
            }
        }
    }
}

impl<C> ServerEvent<C> {
    /// Invoke the matching handler method.
    pub fn dispatch<H: ServerHandler<C> + ?Sized>(self, handler: &mut H) {
        match self {
            ServerEvent::Packet { id, packet } => handler.on_packet(id, packet),
            ServerEvent::UnreliablePacket { id, packet } => {
                handler.on_unreliable_packet(id, packet)
            }
            ServerEvent::ClientConnected { id, addr } => handler.on_client_connected(id, addr),
            ServerEvent::ClientDisconnected { id } => handler.on_client_disconnected(id),
            ServerEvent::ConnectionLost { id } => handler.on_connection_lost(id),
        }
    }
}
