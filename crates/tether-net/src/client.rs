//! Client side of a reliable session.
//!
//! A [`GameClient`] owns at most one TCP transport at a time. Each transport
//! gets a receive task that decodes frames into the session's
//! [`EventBuffer`]; faults seen by that task become heartbeat checks, and a
//! failed heartbeat either tears the session down or repairs it by
//! reconnecting to the remembered peer. The application only ever sees the
//! outcome through [`GameClient::fire_events`].
//!
//! Transitions:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> HeartbeatFailed -> Repairing -> Connected
//!                                                          \             \-> Disconnected
//!                                                           \-> Disconnected
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{ClientEvent, ClientHandler, EventBuffer};
use crate::framing::{self, FrameConfig, FrameError, ReadFailure};
use crate::pipeline::{PipelineSlot, PipelineStrategy};
use crate::platform::{self, Liveness, SocketConfig};
use crate::udp::{UdpChannel, UdpConfig};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Transport established.
    Connected,
    /// A liveness probe just failed.
    HeartbeatFailed,
    /// Reconnecting to the last peer.
    Repairing,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Client session settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local port to bind before connecting. `None` picks an ephemeral port.
    pub local_port: Option<u16>,
    /// Repair a broken transport instead of reporting it lost.
    pub auto_repair: bool,
    /// Upper bound for an explicit connect. Default: 5s.
    pub connect_timeout: Duration,
    /// Upper bound for acquiring the transport during a heartbeat. Default: 500ms.
    pub heartbeat_timeout: Duration,
    /// Upper bound for the reachability probe during repair. Default: 1s.
    pub repair_probe_timeout: Duration,
    /// Upper bound for writing one frame. Default: 5s.
    pub send_timeout: Duration,
    /// Frame limits.
    pub frame: FrameConfig,
    /// Socket options.
    pub socket: SocketConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_port: None,
            auto_repair: true,
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_millis(500),
            repair_probe_timeout: Duration::from_millis(1000),
            send_timeout: Duration::from_secs(5),
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// One established TCP transport and its receive task.
struct Transport {
    writer: OwnedWriteHalf,
    shutdown_tx: watch::Sender<bool>,
    reader: JoinHandle<()>,
    /// Set by the receive task when it stops on a fault.
    broken: Arc<AtomicBool>,
    peer: SocketAddr,
    generation: u64,
}

impl Transport {
    fn liveness(&self) -> Liveness {
        if self.broken.load(Ordering::Acquire) {
            return Liveness::Faulted(std::io::ErrorKind::BrokenPipe.into());
        }
        platform::probe_liveness(self.writer.as_ref())
    }

    /// Stop the receive task, close the socket and wait for the task to end.
    async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.writer.shutdown().await;
        let _ = self.reader.await;
    }
}

struct ClientInner<C, S> {
    config: ClientConfig,
    state: ConnectionStateWatch,
    pipeline: PipelineSlot<S, C>,
    transport: Mutex<Option<Transport>>,
    generation: AtomicU64,
    handshake: std::sync::Mutex<Option<C>>,
    events: EventBuffer<ClientEvent<S>>,
    outbound_failed: AtomicBool,
    udp: RwLock<Option<Arc<UdpChannel<S, C>>>>,
}

/// Reliable client session.
///
/// `C` is the packet family the client sends, `S` the family the server
/// sends back.
pub struct GameClient<C, S> {
    inner: Arc<ClientInner<C, S>>,
}

impl<C, S> GameClient<C, S>
where
    C: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    /// Create a disconnected client using `pipeline` for all conversions.
    pub fn new(config: ClientConfig, pipeline: Arc<dyn PipelineStrategy<S, C>>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: ConnectionStateWatch::new(),
                pipeline: PipelineSlot::new(pipeline),
                transport: Mutex::new(None),
                generation: AtomicU64::new(0),
                handshake: std::sync::Mutex::new(None),
                events: EventBuffer::new(),
                outbound_failed: AtomicBool::new(false),
                udp: RwLock::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Replace the pipeline strategy. Applies to frames and datagrams
    /// converted afterwards, including those of an attached UDP channel.
    pub fn set_pipeline(&self, pipeline: Arc<dyn PipelineStrategy<S, C>>) {
        self.inner.pipeline.replace(pipeline);
    }

    /// Number of events waiting for the next [`fire_events`](Self::fire_events).
    pub fn pending_events(&self) -> usize {
        self.inner.events.len()
    }

    /// Remote endpoint of the current transport.
    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.lock().await.as_ref().map(|t| t.peer)
    }

    /// Local endpoint of the current transport.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.inner.transport.lock().await;
        slot.as_ref().and_then(|t| t.writer.local_addr().ok())
    }

    /// Connect to `addr`. A no-op while connected or connecting.
    ///
    /// Failures are logged and leave the client `Disconnected`.
    pub async fn connect(&self, addr: SocketAddr) {
        self.inner.connect(addr).await;
    }

    /// Resolve `host` and connect to its first IPv4 address.
    pub async fn connect_host(&self, host: &str, port: u16) {
        match tokio::net::lookup_host((host, port)).await {
            Ok(mut addrs) => match addrs.find(SocketAddr::is_ipv4) {
                Some(addr) => self.connect(addr).await,
                None => warn!(host, "Host has no IPv4 address"),
            },
            Err(e) => warn!(host, error = %e, "Failed to resolve host"),
        }
    }

    /// Connect and send `handshake` as the first packet. The handshake is
    /// sent again after every successful repair.
    pub async fn connect_with_handshake(&self, addr: SocketAddr, handshake: C) {
        self.set_handshake(Some(handshake));
        self.inner.connect(addr).await;
    }

    /// Packet sent first on every new transport, including those opened by
    /// [`connect_host`](Self::connect_host) and by repair.
    pub fn set_handshake(&self, handshake: Option<C>) {
        if let Ok(mut slot) = self.inner.handshake.lock() {
            *slot = handshake;
        }
    }

    /// Close the transport and wait for its receive task. Pending events
    /// are discarded. A no-op while disconnected.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.transport.lock().await;
        let Some(transport) = slot.take() else {
            return;
        };
        let peer = transport.peer;
        transport.close().await;
        self.inner.state.set(ConnectionState::Disconnected);
        self.inner.events.clear();
        info!(%peer, "Disconnected");
    }

    /// Send one packet on the reliable channel.
    ///
    /// Returns whether the frame was written. A write fault triggers a
    /// heartbeat check with repair instead of an error.
    pub async fn send_packet(&self, packet: &C) -> bool {
        let bytes = match self.inner.pipeline().convert_send(packet) {
            Ok(bytes) => bytes,
            Err(e) if e.is_configuration_error() => {
                error!(error = %e, "Packet cannot be encoded");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode packet");
                return false;
            }
        };

        let result = {
            let mut slot = self.inner.transport.lock().await;
            let Some(transport) = slot.as_mut() else {
                debug!("Send dropped, not connected");
                return false;
            };
            self.inner.write(transport, &bytes).await
        };

        match result {
            Ok(()) => true,
            Err(FrameError::PayloadTooLarge { size, max }) => {
                warn!(size, max, "Packet exceeds frame limit, dropped");
                false
            }
            Err(e) => {
                warn!(error = %e, "Send failed, checking connection");
                self.inner.outbound_failed.store(true, Ordering::Release);
                self.inner.heartbeat(true, None).await;
                false
            }
        }
    }

    /// Probe the transport without a round trip.
    ///
    /// On failure the session is repaired when `repair` and auto-repair are
    /// both enabled, otherwise it is closed and a lost event is queued.
    /// Returns whether the probe succeeded.
    pub async fn heartbeat_connection(&self, repair: bool) -> bool {
        self.inner.heartbeat(repair, None).await
    }

    /// Run `handler` for every event queued before this call, reliable
    /// events first. Returns the number of events delivered.
    pub fn fire_events<H: ClientHandler<S> + ?Sized>(&self, handler: &mut H) -> usize {
        let mut fired = 0;
        for event in self.inner.events.drain() {
            event.dispatch(handler);
            fired += 1;
        }
        if let Some(udp) = self.inner.udp_channel() {
            for (_, packet) in udp.drain() {
                handler.on_unreliable_packet(packet);
                fired += 1;
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

    /// Send one datagram to the side-channel target.
    pub async fn send_unreliable(&self, packet: &C) -> bool {
        match self.inner.udp_channel() {
            Some(udp) => udp.send(packet).await,
            None => {
                debug!("Unreliable send dropped, no UDP channel attached");
                false
            }
        }
    }
}

impl<C, S> ClientInner<C, S>
where
    C: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    fn pipeline(&self) -> Arc<dyn PipelineStrategy<S, C>> {
        self.pipeline.current()
    }

    fn udp_channel(&self) -> Option<Arc<UdpChannel<S, C>>> {
        self.udp.read().ok().and_then(|slot| slot.clone())
    }

    fn handshake(&self) -> Option<C> {
        self.handshake.lock().ok().and_then(|slot| slot.clone())
    }

    async fn write(&self, transport: &mut Transport, bytes: &[u8]) -> Result<(), FrameError> {
        match tokio::time::timeout(
            self.config.send_timeout,
            framing::write_frame(&mut transport.writer, bytes, &self.config.frame),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FrameError::Io(std::io::ErrorKind::TimedOut.into())),
        }
    }

    /// Encode and write the handshake on a freshly installed transport.
    async fn send_handshake(&self, transport: &mut Transport) -> bool {
        let Some(handshake) = self.handshake() else {
            return true;
        };
        let bytes = match self.pipeline().convert_send(&handshake) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Handshake cannot be encoded");
                return false;
            }
        };
        match self.write(transport, &bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to send handshake");
                false
            }
        }
    }

    fn install(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Transport {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (read_half, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broken = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            read_half,
            shutdown_rx,
            Arc::clone(&broken),
            generation,
        ));

        self.outbound_failed.store(false, Ordering::Release);
        Transport {
            writer,
            shutdown_tx,
            reader,
            broken,
            peer,
            generation,
        }
    }

    async fn connect(self: &Arc<Self>, addr: SocketAddr) {
        let mut slot = self.transport.lock().await;
        if slot.is_some()
            || matches!(
                self.state.current(),
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            debug!(%addr, state = ?self.state.current(), "Connect ignored");
            return;
        }

        self.state.set(ConnectionState::Connecting);
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            platform::connect_stream(addr, self.config.local_port, &self.config.socket),
        )
        .await;

        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "Connect failed");
                self.state.set(ConnectionState::Disconnected);
                return;
            }
            Err(_) => {
                warn!(%addr, "Connect timed out");
                self.state.set(ConnectionState::Disconnected);
                return;
            }
        };

        let mut transport = self.install(stream, addr);
        let handshake_ok = self.send_handshake(&mut transport).await;
        *slot = Some(transport);
        self.state.set(ConnectionState::Connected);
        info!(%addr, "Connected");

        if !handshake_ok {
            self.outbound_failed.store(true, Ordering::Release);
            drop(slot);
            self.heartbeat(true, None).await;
        }
    }

    /// Liveness check. `generation` restricts the check to one transport so
    /// faults reported by a replaced transport are ignored.
    async fn heartbeat(self: &Arc<Self>, repair: bool, generation: Option<u64>) -> bool {
        let Ok(mut slot) =
            tokio::time::timeout(self.config.heartbeat_timeout, self.transport.lock()).await
        else {
            debug!("Heartbeat skipped, transport busy");
            return self.state.current() == ConnectionState::Connected;
        };

        let Some(transport) = slot.as_ref() else {
            return false;
        };
        if let Some(generation) = generation
            && generation != transport.generation
        {
            return true;
        }

        let outbound_failed = self.outbound_failed.swap(false, Ordering::AcqRel);
        let liveness = transport.liveness();
        if liveness.is_alive() && !outbound_failed {
            return true;
        }

        let started = Instant::now();
        warn!(peer = %transport.peer, ?liveness, outbound_failed, "Heartbeat failed");
        self.state.set(ConnectionState::HeartbeatFailed);

        if repair && self.config.auto_repair {
            self.repair(&mut slot, started).await;
        } else if let Some(transport) = slot.take() {
            transport.close().await;
            self.declare_lost();
        }
        false
    }

    /// Replace the transport in `slot` with a fresh connection to the same
    /// peer, or give up and report the session lost.
    async fn repair(self: &Arc<Self>, slot: &mut MutexGuard<'_, Option<Transport>>, started: Instant) {
        let Some(old) = slot.take() else {
            return;
        };
        let peer = old.peer;
        self.state.set(ConnectionState::Repairing);
        old.close().await;
        info!(%peer, "Repairing connection");

        let probe = tokio::time::timeout(
            self.config.repair_probe_timeout,
            platform::connect_stream(peer, None, &self.config.socket),
        )
        .await;

        let stream = match probe {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "Peer unreachable, connection lost");
                self.declare_lost();
                return;
            }
            Err(_) => {
                warn!(%peer, "Reachability probe timed out, connection lost");
                self.declare_lost();
                return;
            }
        };

        let mut transport = self.install(stream, peer);
        let handshake_ok = self.send_handshake(&mut transport).await;

        if handshake_ok && transport.liveness().is_alive() {
            **slot = Some(transport);
            self.state.set(ConnectionState::Connected);
            let transition = started.elapsed();
            info!(%peer, ?transition, "Connection repaired");
            self.events.push(ClientEvent::ConnectionRepaired { transition });
        } else {
            transport.close().await;
            warn!(%peer, "Reconnected transport failed its heartbeat, connection lost");
            self.declare_lost();
        }
    }

    fn declare_lost(&self) {
        self.state.set(ConnectionState::Disconnected);
        self.events.push(ClientEvent::ConnectionLost);
    }

    /// Tear down the transport of `generation` after the peer went away.
    async fn lose(self: &Arc<Self>, generation: u64) {
        let mut slot = self.transport.lock().await;
        if !matches!(slot.as_ref(), Some(t) if t.generation == generation) {
            return;
        }
        if let Some(transport) = slot.take() {
            transport.close().await;
            self.declare_lost();
        }
    }

    async fn handle_frame(&self, payload: &[u8]) {
        let pipeline = self.pipeline();
        let delay = pipeline.receive_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match pipeline.convert_receive(payload) {
            Ok(Some(packet)) => self.events.push(ClientEvent::Packet(packet)),
            Ok(None) => {}
            Err(e) if e.is_configuration_error() => {
                error!(error = %e, "Received an unregistered packet kind, discarded");
            }
            Err(e) => warn!(error = %e, "Failed to decode packet, discarded"),
        }
    }
}

async fn read_loop<C, S>(
    inner: Weak<ClientInner<C, S>>,
    mut reader: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
    broken: Arc<AtomicBool>,
    generation: u64,
) where
    C: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
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
                inner.handle_frame(&payload).await;
                continue;
            }
            Err(error) => error,
        };

        match error.classify() {
            ReadFailure::Retry => continue,
            ReadFailure::Closed => {
                info!("Server closed the connection");
                broken.store(true, Ordering::Release);
                tokio::spawn(async move { inner.lose(generation).await });
            }
            ReadFailure::Desynchronized => {
                warn!(error = %error, "Stream desynchronized, dropping connection");
                broken.store(true, Ordering::Release);
                tokio::spawn(async move { inner.lose(generation).await });
            }
            ReadFailure::Broken => {
                warn!(error = %error, "Receive failed, checking connection");
                broken.store(true, Ordering::Release);
                tokio::spawn(async move {
                    inner.heartbeat(true, Some(generation)).await;
                });
            }
        }
        break;
    }

    debug!(generation, "Client receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{TestPacket, test_codec, test_pipeline, wait_until};
    use tokio::net::TcpListener;

    type Client = GameClient<TestPacket, TestPacket>;

    fn client(config: ClientConfig) -> Client {
        GameClient::new(config, test_pipeline())
    }

    /// Accept one connection and hand back the server-side stream.
    async fn accept_one() -> (SocketAddr, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        (addr, handle)
    }

    fn drain_all(client: &Client) -> Vec<ClientEvent<TestPacket>> {
        let mut seen = Vec::new();
        client.fire_events(&mut |event: ClientEvent<TestPacket>| seen.push(event));
        seen
    }

    #[test]
    fn test_connection_state_starts_disconnected() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
        watch.set(ConnectionState::Repairing);
        assert_eq!(watch.current(), ConnectionState::Repairing);
    }

    #[tokio::test]
    async fn test_connect_refused_stays_disconnected() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let client = client(ClientConfig::default());
        client.connect(addr).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.heartbeat_connection(false).await);
        assert_eq!(client.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        client.connect(addr).await;
        let _server = server.await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let local = client.local_addr().await;
        client.connect(addr).await;
        assert_eq!(client.local_addr().await, local);
        assert_eq!(client.remote_addr().await, Some(addr));
    }

    #[tokio::test]
    async fn test_handshake_is_first_frame() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        client
            .connect_with_handshake(
                addr,
                TestPacket::Hello {
                    name: "tester".to_string(),
                },
            )
            .await;

        let mut stream = server.await.unwrap();
        let frame = framing::read_frame(&mut stream, &FrameConfig::default())
            .await
            .unwrap();
        let hello: TestPacket = test_codec().deserialize(&frame, None).unwrap();
        assert_eq!(
            hello,
            TestPacket::Hello {
                name: "tester".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_received_frames_wait_for_fire_events() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        client.connect(addr).await;
        let mut stream = server.await.unwrap();

        let codec = test_codec();
        for seq in 1..=3 {
            let bytes = codec.serialize(&TestPacket::Pong { seq }).unwrap();
            framing::write_frame(&mut stream, &bytes, &FrameConfig::default())
                .await
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || client.pending_events() == 3).await);
        assert_eq!(
            drain_all(&client),
            vec![
                ClientEvent::Packet(TestPacket::Pong { seq: 1 }),
                ClientEvent::Packet(TestPacket::Pong { seq: 2 }),
                ClientEvent::Packet(TestPacket::Pong { seq: 3 }),
            ]
        );
        assert!(drain_all(&client).is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        client.connect(addr).await;
        let mut stream = server.await.unwrap();

        let config = FrameConfig::default();
        framing::write_frame(&mut stream, &[1, 0xEE], &config).await.unwrap();
        let bytes = test_codec().serialize(&TestPacket::Ping { seq: 4 }).unwrap();
        framing::write_frame(&mut stream, &bytes, &config).await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || client.pending_events() == 1).await);
        assert_eq!(drain_all(&client), vec![ClientEvent::Packet(TestPacket::Ping { seq: 4 })]);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_remote_close_queues_lost() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        client.connect(addr).await;
        drop(server.await.unwrap());

        assert!(
            wait_until(Duration::from_secs(2), || {
                client.state() == ConnectionState::Disconnected
            })
            .await
        );
        assert_eq!(drain_all(&client), vec![ClientEvent::ConnectionLost]);
    }

    #[tokio::test]
    async fn test_heartbeat_without_repair_reports_lost() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig {
            auto_repair: true,
            ..Default::default()
        });
        client.connect(addr).await;
        let stream = server.await.unwrap();
        assert!(client.heartbeat_connection(false).await);

        // Simulate a failed write.
        client.inner.outbound_failed.store(true, Ordering::Release);
        assert!(!client.heartbeat_connection(false).await);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(drain_all(&client), vec![ClientEvent::ConnectionLost]);
        drop(stream);
    }

    #[tokio::test]
    async fn test_disconnect_discards_pending_events() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        client.connect(addr).await;
        let mut stream = server.await.unwrap();

        let bytes = test_codec().serialize(&TestPacket::Pong { seq: 1 }).unwrap();
        framing::write_frame(&mut stream, &bytes, &FrameConfig::default())
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || client.pending_events() == 1).await);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.fire_events(&mut |_: ClientEvent<TestPacket>| {}), 0);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let client = client(ClientConfig::default());
        assert!(!client.send_packet(&TestPacket::Ping { seq: 1 }).await);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_state_subscriber_sees_connect() {
        let (addr, server) = accept_one().await;
        let client = client(ClientConfig::default());
        let mut rx = client.subscribe_state();

        client.connect(addr).await;
        let _server = server.await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }
}
