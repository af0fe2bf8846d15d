//! Server side: accept loop, connection registry and bulk operations.
//!
//! Every accepted stream goes through an admission task (optional handshake
//! approval, identifier allocation, registration) before its receive task is
//! started, so a receive task can never push an event for an identifier the
//! registry does not know yet.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::events::{EventBuffer, ServerEvent, ServerHandler};
use crate::framing::{self, FrameConfig, FrameError, ReadFailure};
use crate::pipeline::{PipelineSlot, PipelineStrategy};
use crate::platform::{self, SocketConfig};
use crate::udp::{UdpChannel, UdpConfig};

/// Server-assigned identifier of one client session. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out connection identifiers.
///
/// Scans forward from a running counter, skipping zero and identifiers still
/// held by live sessions. Identifiers are only reused after the counter wraps.
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    /// Create an allocator starting at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an allocator whose first candidate is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next identifier for which `in_use` is false.
    ///
    /// `live` is the number of identifiers currently held; after `live + 1`
    /// rejected candidates the space is considered exhausted.
    pub fn allocate(
        &self,
        in_use: impl Fn(ConnectionId) -> bool,
        live: usize,
    ) -> Option<ConnectionId> {
        let mut probes = 0usize;
        while probes <= live {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            let id = ConnectionId(raw);
            if !in_use(id) {
                return Some(id);
            }
            probes += 1;
        }
        None
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration failures. Each one is fatal to a single accept only.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection limit is reached.
    #[error("connection limit of {0} reached")]
    Full(usize),
    /// No identifier is free.
    #[error("no free connection identifier")]
    IdsExhausted,
    /// The registry was closed and takes no new sessions.
    #[error("registry is closed")]
    Closed,
}

/// Concurrent table of live sessions keyed by [`ConnectionId`].
///
/// The lock is never held across I/O; bulk operations work on a snapshot of
/// `Arc` handles.
pub struct ConnectionRegistry<T> {
    table: RwLock<HashMap<ConnectionId, Arc<T>>>,
    // Only written while the table write lock is held.
    open: AtomicBool,
    ids: IdAllocator,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create an empty registry holding at most `max_connections` sessions.
    pub fn new(max_connections: usize) -> Self {
        Self::with_allocator(max_connections, IdAllocator::new())
    }

    /// Create a registry with a specific allocator.
    pub fn with_allocator(max_connections: usize, ids: IdAllocator) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            open: AtomicBool::new(true),
            ids,
            max_connections,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<T>>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<T>>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an identifier, build the entry for it and insert it, all
    /// under one write lock.
    pub fn register(
        &self,
        build: impl FnOnce(ConnectionId) -> T,
    ) -> Result<(ConnectionId, Arc<T>), RegistryError> {
        let mut table = self.write();
        if !self.open.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        if table.len() >= self.max_connections {
            return Err(RegistryError::Full(self.max_connections));
        }
        let id = self
            .ids
            .allocate(|id| table.contains_key(&id), table.len())
            .ok_or(RegistryError::IdsExhausted)?;
        let entry = Arc::new(build(id));
        table.insert(id, Arc::clone(&entry));
        Ok((id, entry))
    }

    /// Look up a live session.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<T>> {
        self.read().get(&id).cloned()
    }

    /// Remove `id` only if it still maps to `entry`.
    pub fn remove_entry(&self, id: ConnectionId, entry: &Arc<T>) -> bool {
        let mut table = self.write();
        match table.get(&id) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                table.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.write().drain().map(|(_, entry)| entry).collect()
    }

    /// Refuse further registrations and remove every session in one step.
    ///
    /// A [`register`](Self::register) racing with this either lands before
    /// the drain and is returned here, or fails with [`RegistryError::Closed`].
    pub fn close(&self) -> Vec<Arc<T>> {
        let mut table = self.write();
        self.open.store(false, Ordering::Release);
        table.drain().map(|(_, entry)| entry).collect()
    }

    /// Accept registrations again after [`close`](Self::close).
    pub fn reopen(&self) {
        let _table = self.write();
        self.open.store(true, Ordering::Release);
    }

    /// Whether new sessions may register.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<T>)> {
        self.read()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect()
    }

    /// Identifiers of the current entries.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.read().keys().copied().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Outcome of the handshake approval callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Approval<S> {
    /// Register the client, optionally answering with a packet.
    Accept(Option<S>),
    /// Refuse the client.
    Deny(String),
}

/// Decides whether a client may join, based on its first packet.
pub trait ConnectionApprover<C, S>: Send + Sync {
    /// Evaluate the handshake packet from `addr`.
    fn approve(&self, handshake: &C, addr: SocketAddr) -> Approval<S>;
}

impl<C, S, F> ConnectionApprover<C, S> for F
where
    F: Fn(&C, SocketAddr) -> Approval<S> + Send + Sync,
{
    fn approve(&self, handshake: &C, addr: SocketAddr) -> Approval<S> {
        self(handshake, addr)
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Default: `0.0.0.0:9000`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions. Default: 256.
    pub max_connections: usize,
    /// Upper bound for acquiring a peer's writer during a heartbeat.
    pub heartbeat_timeout: Duration,
    /// Upper bound for writing one frame to one peer.
    pub send_timeout: Duration,
    /// Upper bound for receiving the handshake packet.
    pub handshake_timeout: Duration,
    /// Frame limits.
    pub frame: FrameConfig,
    /// Socket options.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_connections: 256,
            heartbeat_timeout: Duration::from_millis(500),
            send_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Server half of one client session.
pub(crate) struct PeerSession {
    pub(crate) id: ConnectionId,
    pub(crate) addr: SocketAddr,
    pub(crate) writer: Mutex<OwnedWriteHalf>,
    shutdown_tx: watch::Sender<bool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    broken: AtomicBool,
    outbound_failed: AtomicBool,
    terminated: AtomicBool,
    udp_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl PeerSession {
    async fn write(&self, bytes: &[u8], frame: &FrameConfig, limit: Duration) -> Result<(), FrameError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            framing::write_frame(&mut *writer, bytes, frame).await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Io(std::io::ErrorKind::TimedOut.into())),
        }
    }

    fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr.lock().ok().and_then(|slot| *slot)
    }

    /// Stop the receive task, close the socket and wait for the task.
    async fn close(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.writer.lock().await.shutdown().await;
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }
}

/// Which event an eviction queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    /// The client closed the stream.
    Disconnected,
    /// Transport fault or failed heartbeat.
    Lost,
    /// Requested by the application.
    Silent,
}

struct AcceptLoop {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ServerInner<S, C> {
    config: ServerConfig,
    pipeline: PipelineSlot<C, S>,
    approver: RwLock<Option<Arc<dyn ConnectionApprover<C, S>>>>,
    registry: ConnectionRegistry<PeerSession>,
    events: EventBuffer<ServerEvent<C>>,
    accept: Mutex<Option<AcceptLoop>>,
    udp: RwLock<Option<Arc<UdpChannel<C, S>>>>,
}

/// Reliable server hosting many client sessions.
///
/// `S` is the packet family the server sends, `C` the family clients send.
pub struct GameServer<S, C> {
    inner: Arc<ServerInner<S, C>>,
}

impl<S, C> GameServer<S, C>
where
    S: Send + Sync + 'static,
    C: Send + 'static,
{
    /// Create a server that is not yet listening.
    pub fn new(config: ServerConfig, pipeline: Arc<dyn PipelineStrategy<C, S>>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry: ConnectionRegistry::new(config.max_connections),
                config,
                pipeline: PipelineSlot::new(pipeline),
                approver: RwLock::new(None),
                events: EventBuffer::new(),
                accept: Mutex::new(None),
                udp: RwLock::new(None),
            }),
        }
    }

    /// Require every client to pass `approver` with its first packet.
    pub fn set_approver(&self, approver: Arc<dyn ConnectionApprover<C, S>>) {
        if let Ok(mut slot) = self.inner.approver.write() {
            *slot = Some(approver);
        }
    }

    /// Replace the pipeline strategy for the reliable path and any attached
    /// UDP channel.
    pub fn set_pipeline(&self, pipeline: Arc<dyn PipelineStrategy<C, S>>) {
        self.inner.pipeline.replace(pipeline);
    }

    /// Start listening. Returns the bound address; a no-op returning the
    /// existing address while already hosting.
    pub async fn host(&self) -> std::io::Result<SocketAddr> {
        let mut accept = self.inner.accept.lock().await;
        if let Some(running) = accept.as_ref() {
            debug!(addr = %running.local_addr, "Already hosting");
            return Ok(running.local_addr);
        }

        let listener = platform::create_listener(self.inner.config.bind_addr, &self.inner.config.socket)?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.inner.registry.reopen();
        let task = tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener, shutdown_rx));
        *accept = Some(AcceptLoop {
            local_addr,
            shutdown_tx,
            task,
        });

        info!(addr = %local_addr, "Server listening");
        Ok(local_addr)
    }

    /// Address the server is listening on.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.accept.lock().await.as_ref().map(|a| a.local_addr)
    }

    /// Stop accepting and drop every client without queuing events.
    pub async fn close(&self) {
        let running = self.inner.accept.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown_tx.send(true);
            let _ = running.task.await;
        }

        let peers = self.inner.registry.close();
        let count = peers.len();
        for peer in peers {
            peer.close().await;
        }
        self.inner.events.clear();
        info!(dropped = count, "Server closed");
    }

    /// Number of registered clients.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Identifiers of registered clients.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }

    /// Remote endpoint of a registered client.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.inner.registry.get(id).map(|peer| peer.addr)
    }

    /// Number of events waiting for the next [`fire_events`](Self::fire_events).
    pub fn pending_events(&self) -> usize {
        self.inner.events.len()
    }

    #[cfg(test)]
    pub(crate) fn peer(&self, id: ConnectionId) -> Option<Arc<PeerSession>> {
        self.inner.registry.get(id)
    }

    /// Send `packet` to each of `ids`. Returns how many writes succeeded.
    ///
    /// Writes run concurrently; a failing peer gets a heartbeat check and
    /// never holds up the others.
    pub async fn send_packet(&self, packet: &S, ids: &[ConnectionId]) -> usize {
        self.inner.send_to(packet, ids).await
    }

    /// Send `packet` to every client registered at call time.
    pub async fn broadcast(&self, packet: &S) -> usize {
        let ids = self.inner.registry.ids();
        self.inner.send_to(packet, &ids).await
    }

    /// Close and remove one client without queuing an event. Returns
    /// whether a live session was removed.
    pub async fn disconnect_client(&self, id: ConnectionId) -> bool {
        self.inner.evict(id, Eviction::Silent).await
    }

    /// Close and remove one client and queue `ConnectionLost` for it.
    /// Kicking an unknown id is a no-op.
    pub async fn kick(&self, id: ConnectionId) -> bool {
        self.inner.evict(id, Eviction::Lost).await
    }

    /// Probe every registered client and evict the dead ones. Returns the
    /// number evicted.
    pub async fn heartbeat_connections(&self) -> usize {
        let mut probes = JoinSet::new();
        for (_, peer) in self.inner.registry.snapshot() {
            let inner = Arc::clone(&self.inner);
            probes.spawn(async move { inner.heartbeat_peer(&peer).await });
        }

        let mut evicted = 0;
        while let Some(joined) = probes.join_next().await {
            if matches!(joined, Ok(false)) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Run `handler` for every event queued before this call, reliable
    /// events first. Returns the number of events delivered.
    pub fn fire_events<H: ServerHandler<C> + ?Sized>(&self, handler: &mut H) -> usize {
        let mut fired = 0;
        for event in self.inner.events.drain() {
            event.dispatch(handler);
            fired += 1;
        }

        if let Some(udp) = self.inner.udp_channel() {
            for (from, packet) in udp.drain() {
                match self.inner.attribute(from) {
                    Some(peer) => {
                        if let Ok(mut slot) = peer.udp_addr.lock() {
                            *slot = Some(from);
                        }
                        handler.on_unreliable_packet(peer.id, packet);
                        fired += 1;
                    }
                    None => debug!(%from, "Datagram from unknown client dropped"),
                }
            }
        }
        fired
    }

    /// Attach a UDP side-channel, replacing any previous one. Returns the
    /// bound local address.
    pub fn attach_udp(&self, config: &UdpConfig) -> std::io::Result<SocketAddr> {
        let channel = Arc::new(UdpChannel::bind(config, self.inner.pipeline.clone())?);
        let local = channel.local_addr()?;
        if let Ok(mut slot) = self.inner.udp.write() {
            *slot = Some(channel);
        }
        Ok(local)
    }

    /// Send one datagram to the side-channel target (group or broadcast).
    pub async fn send_unreliable(&self, packet: &S) -> bool {
        match self.inner.udp_channel() {
            Some(udp) => udp.send(packet).await,
            None => {
                debug!("Unreliable send dropped, no UDP channel attached");
                false
            }
        }
    }

    /// Send one datagram to each client whose UDP endpoint is known from an
    /// earlier datagram. Returns how many were sent.
    pub async fn send_unreliable_to(&self, packet: &S, ids: &[ConnectionId]) -> usize {
        let Some(udp) = self.inner.udp_channel() else {
            return 0;
        };
        let mut sent = 0;
        for id in ids {
            let Some(addr) = self.inner.registry.get(*id).and_then(|p| p.udp_addr()) else {
                continue;
            };
            if udp.send_to(packet, addr).await {
                sent += 1;
            }
        }
        sent
    }
}

impl<S, C> ServerInner<S, C>
where
    S: Send + Sync + 'static,
    C: Send + 'static,
{
    fn pipeline(&self) -> Arc<dyn PipelineStrategy<C, S>> {
        self.pipeline.current()
    }

    fn approver(&self) -> Option<Arc<dyn ConnectionApprover<C, S>>> {
        self.approver.read().ok().and_then(|slot| slot.clone())
    }

    fn udp_channel(&self) -> Option<Arc<UdpChannel<C, S>>> {
        self.udp.read().ok().and_then(|slot| slot.clone())
    }

    /// Match a datagram source to a client: exact address first, then a
    /// unique IP.
    fn attribute(&self, from: SocketAddr) -> Option<Arc<PeerSession>> {
        let peers = self.registry.snapshot();
        if let Some((_, peer)) = peers
            .iter()
            .find(|(_, p)| p.addr == from || p.udp_addr() == Some(from))
        {
            return Some(Arc::clone(peer));
        }

        let mut same_ip = peers.into_iter().filter(|(_, p)| p.addr.ip() == from.ip());
        match (same_ip.next(), same_ip.next()) {
            (Some((_, peer)), None) => Some(peer),
            _ => None,
        }
    }

    async fn admit(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = platform::configure_stream(&stream, &self.config.socket) {
            warn!(%addr, error = %e, "Failed to configure accepted socket");
        }
        let (mut read_half, mut write_half) = stream.into_split();

        let mut response = None;
        if let Some(approver) = self.approver() {
            let Some(handshake) = self.read_handshake(&mut read_half, addr).await else {
                return;
            };
            match approver.approve(&handshake, addr) {
                Approval::Accept(reply) => response = reply,
                Approval::Deny(reason) => {
                    info!(%addr, reason, "Connection denied");
                    let _ = write_half.shutdown().await;
                    return;
                }
            }
        }

        if !self.registry.is_open() {
            debug!(%addr, "Server closed during admission");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registered = self.registry.register(|id| PeerSession {
            id,
            addr,
            writer: Mutex::new(write_half),
            shutdown_tx,
            reader: std::sync::Mutex::new(None),
            broken: AtomicBool::new(false),
            outbound_failed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            udp_addr: std::sync::Mutex::new(None),
        });
        let (id, peer) = match registered {
            Ok(registered) => registered,
            Err(RegistryError::Closed) => {
                debug!(%addr, "Server closed during admission");
                return;
            }
            Err(e) => {
                warn!(%addr, error = %e, "Rejecting connection");
                return;
            }
        };

        if let Some(reply) = response {
            match self.pipeline().convert_send(&reply) {
                Ok(bytes) => {
                    if let Err(e) = peer.write(&bytes, &self.config.frame, self.config.send_timeout).await {
                        warn!(%id, error = %e, "Failed to send handshake response");
                        peer.outbound_failed.store(true, Ordering::Release);
                    }
                }
                Err(e) => error!(%id, error = %e, "Handshake response cannot be encoded"),
            }
        }

        self.events.push(ServerEvent::ClientConnected { id, addr });
        info!(%id, %addr, "Client connected");

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&self),
            Arc::clone(&peer),
            read_half,
            shutdown_rx,
        ));
        if let Ok(mut slot) = peer.reader.lock() {
            *slot = Some(reader);
        }
    }

    async fn read_handshake(&self, reader: &mut OwnedReadHalf, addr: SocketAddr) -> Option<C> {
        let frame = tokio::time::timeout(
            self.config.handshake_timeout,
            framing::read_frame(reader, &self.config.frame),
        )
        .await;

        let payload = match frame {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "Handshake read failed");
                return None;
            }
            Err(_) => {
                warn!(%addr, "Handshake timed out");
                return None;
            }
        };

        match self.pipeline().convert_receive(&payload) {
            Ok(Some(packet)) => Some(packet),
            Ok(None) => {
                warn!(%addr, "Handshake dropped by pipeline");
                None
            }
            Err(e) => {
                warn!(%addr, error = %e, "Invalid handshake");
                None
            }
        }
    }

    async fn send_to(&self, packet: &S, ids: &[ConnectionId]) -> usize {
        let bytes: Arc<[u8]> = match self.pipeline().convert_send(packet) {
            Ok(bytes) => bytes.into(),
            Err(e) if e.is_configuration_error() => {
                error!(error = %e, "Packet cannot be encoded");
                return 0;
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode packet");
                return 0;
            }
        };

        let mut writes = JoinSet::new();
        for id in ids {
            let Some(peer) = self.registry.get(*id) else {
                debug!(%id, "Send to unknown client skipped");
                continue;
            };
            let bytes = Arc::clone(&bytes);
            let frame = self.config.frame.clone();
            let limit = self.config.send_timeout;
            writes.spawn(async move {
                let result = peer.write(&bytes, &frame, limit).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        while let Some(joined) = writes.join_next().await {
            let Ok((peer, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => delivered += 1,
                Err(FrameError::PayloadTooLarge { size, max }) => {
                    warn!(id = %peer.id, size, max, "Packet exceeds frame limit, dropped");
                }
                Err(e) => {
                    warn!(id = %peer.id, error = %e, "Send failed, checking connection");
                    peer.outbound_failed.store(true, Ordering::Release);
                    failed.push(peer);
                }
            }
        }

        for peer in failed {
            self.heartbeat_peer(&peer).await;
        }
        delivered
    }

    /// Probe one client; evict it as lost when the probe fails.
    async fn heartbeat_peer(&self, peer: &Arc<PeerSession>) -> bool {
        let alive = match tokio::time::timeout(self.config.heartbeat_timeout, peer.writer.lock()).await {
            Ok(writer) => {
                let outbound_failed = peer.outbound_failed.swap(false, Ordering::AcqRel);
                !peer.broken.load(Ordering::Acquire)
                    && !outbound_failed
                    && platform::probe_liveness(writer.as_ref()).is_alive()
            }
            Err(_) => {
                debug!(id = %peer.id, "Heartbeat skipped, writer busy");
                true
            }
        };

        if !alive {
            warn!(id = %peer.id, "Heartbeat failed, evicting client");
            self.evict_peer(peer, Eviction::Lost).await;
        }
        alive
    }

    async fn evict(&self, id: ConnectionId, eviction: Eviction) -> bool {
        match self.registry.get(id) {
            Some(peer) => self.evict_peer(&peer, eviction).await,
            None => false,
        }
    }

    async fn evict_peer(&self, peer: &Arc<PeerSession>, eviction: Eviction) -> bool {
        if !self.registry.remove_entry(peer.id, peer) {
            return false;
        }
        peer.close().await;

        match eviction {
            Eviction::Disconnected => {
                info!(id = %peer.id, "Client disconnected");
                self.events.push(ServerEvent::ClientDisconnected { id: peer.id });
            }
            Eviction::Lost => {
                info!(id = %peer.id, "Connection lost");
                self.events.push(ServerEvent::ConnectionLost { id: peer.id });
            }
            Eviction::Silent => info!(id = %peer.id, "Client dropped"),
        }
        true
    }

    async fn handle_frame(&self, id: ConnectionId, payload: &[u8]) {
        let pipeline = self.pipeline();
        let delay = pipeline.receive_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match pipeline.convert_receive(payload) {
            Ok(Some(packet)) => self.events.push(ServerEvent::Packet { id, packet }),
            Ok(None) => {}
            Err(e) if e.is_configuration_error() => {
                error!(%id, error = %e, "Received an unregistered packet kind, discarded");
            }
            Err(e) => warn!(%id, error = %e, "Failed to decode packet, discarded"),
        }
    }
}

async fn accept_loop<S, C>(
    inner: Weak<ServerInner<S, C>>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: Send + Sync + 'static,
    C: Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "Accepted connection");
                tokio::spawn(inner.admit(stream, addr));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!("Accept loop exited");
}

async fn read_loop<S, C>(
    inner: Weak<ServerInner<S, C>>,
    peer: Arc<PeerSession>,
    mut reader: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: Send + Sync + 'static,
    C: Send + 'static,
{
    let id = peer.id;
    let Some(frame_config) = inner.upgrade().map(|i| i.config.frame.clone()) else {
        return;
    };

    loop {
        let result = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = framing::read_frame(&mut reader, &frame_config) => result,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let error = match result {
            Ok(payload) => {
                inner.handle_frame(id, &payload).await;
                continue;
            }
            Err(error) => error,
        };

        let eviction = match error.classify() {
            ReadFailure::Retry => continue,
            ReadFailure::Closed => Eviction::Disconnected,
            ReadFailure::Desynchronized => {
                warn!(%id, error = %error, "Stream desynchronized, dropping client");
                Eviction::Lost
            }
            ReadFailure::Broken => {
                warn!(%id, error = %error, "Receive failed");
                Eviction::Lost
            }
        };
        peer.broken.store(true, Ordering::Release);
        let peer = Arc::clone(&peer);
        tokio::spawn(async move {
            inner.evict_peer(&peer, eviction).await;
        });
        break;
    }

    debug!(%id, "Server receive loop exited");
}
