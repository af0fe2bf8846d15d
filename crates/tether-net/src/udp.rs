//! Optional unreliable side-channel.
//!
//! A [`UdpChannel`] is attached to a client or server by composition. It owns
//! one socket and one receive task; decoded datagrams land in their own
//! [`EventBuffer`] which the owning session drains after its reliable events.
//! Nothing that happens here changes the reliable session's state.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::events::{EventBuffer, EventSender};
use crate::pipeline::PipelineSlot;
use crate::platform;

/// Largest datagram the receive task accepts.
pub const MAX_DATAGRAM: usize = 65_507;

/// Settings for one UDP channel.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local address to bind.
    pub bind_addr: SocketAddr,
    /// IPv4 multicast group to join.
    pub multicast_group: Option<Ipv4Addr>,
    /// Default destination for [`UdpChannel::send`] (group, broadcast or a
    /// unicast peer).
    pub target: Option<SocketAddr>,
    /// Only datagrams from this IP are accepted when set.
    pub expected_sender: Option<IpAddr>,
}

impl UdpConfig {
    /// Unicast channel on `bind_addr` with no default target.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            multicast_group: None,
            target: None,
            expected_sender: None,
        }
    }
}

/// A bound UDP socket with its receive task.
pub struct UdpChannel<R, T> {
    socket: Arc<UdpSocket>,
    target: Option<SocketAddr>,
    pipeline: PipelineSlot<R, T>,
    events: EventBuffer<(SocketAddr, R)>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R, T> UdpChannel<R, T>
where
    R: Send + 'static,
    T: 'static,
{
    /// Bind the socket and start receiving. Must run inside a tokio runtime.
    ///
    /// Conversions always use the strategy currently held by `pipeline`.
    pub fn bind(config: &UdpConfig, pipeline: PipelineSlot<R, T>) -> std::io::Result<Self> {
        let socket = Arc::new(platform::bind_udp(config.bind_addr, config.multicast_group)?);
        let events = EventBuffer::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            local = %socket.local_addr()?,
            group = ?config.multicast_group,
            "UDP channel bound"
        );

        let task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            pipeline.clone(),
            events.sender(),
            config.expected_sender,
            shutdown_rx,
        ));

        Ok(Self {
            socket,
            target: config.target,
            pipeline,
            events,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Send to the configured default target. Returns whether a datagram
    /// was handed to the OS.
    pub async fn send(&self, packet: &T) -> bool {
        match self.target {
            Some(target) => self.send_to(packet, target).await,
            None => {
                debug!("UDP send skipped, no default target configured");
                false
            }
        }
    }

    /// Send one datagram to `addr`. Failures are logged, never returned.
    pub async fn send_to(&self, packet: &T, addr: SocketAddr) -> bool {
        let bytes = match self.pipeline.current().convert_send(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%addr, error = %e, "Failed to encode datagram");
                return false;
            }
        };
        if bytes.len() > MAX_DATAGRAM {
            warn!(%addr, len = bytes.len(), "Datagram too large, dropped");
            return false;
        }

        match self.socket.send_to(&bytes, addr).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%addr, error = %e, "UDP send failed");
                false
            }
        }
    }

    /// Take every datagram received so far with its source address.
    pub fn drain(&self) -> Vec<(SocketAddr, R)> {
        self.events.drain()
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop the receive task and wait for it. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        self.events.clear();
    }
}

impl<R, T> Drop for UdpChannel<R, T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn receive_loop<R, T>(
    socket: Arc<UdpSocket>,
    pipeline: PipelineSlot<R, T>,
    events: EventSender<(SocketAddr, R)>,
    expected_sender: Option<IpAddr>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
                ) => continue,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed, stopping channel");
                    break;
                }
            },
        };

        if let Some(expected) = expected_sender
            && from.ip() != expected
        {
            trace!(%from, "Datagram from unexpected sender ignored");
            continue;
        }

        let strategy = pipeline.current();
        let delay = strategy.receive_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match strategy.convert_receive(&buf[..len]) {
            Ok(Some(packet)) => events.push((from, packet)),
            Ok(None) => {}
            Err(e) if e.is_configuration_error() => {
                tracing::error!(%from, error = %e, "Datagram uses an unregistered packet kind");
            }
            Err(e) => debug!(%from, error = %e, "Malformed datagram dropped"),
        }
    }

    debug!("UDP receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{TestPacket, test_pipeline, wait_until};
    use std::time::Duration;

    fn slot() -> PipelineSlot<TestPacket, TestPacket> {
        PipelineSlot::new(test_pipeline())
    }

    fn loopback() -> UdpConfig {
        UdpConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn test_datagrams_reach_the_buffer() {
        let receiver: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        let target = receiver.local_addr().unwrap();

        let mut config = loopback();
        config.target = Some(target);
        let sender: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&config, slot()).unwrap();

        assert!(sender.send(&TestPacket::Ping { seq: 1 }).await);
        assert!(sender.send(&TestPacket::Ping { seq: 2 }).await);

        let mut received = Vec::new();
        assert!(
            wait_until(Duration::from_secs(2), || {
                received.extend(receiver.drain());
                received.len() == 2
            })
            .await
        );
        let from = sender.local_addr().unwrap();
        assert_eq!(
            received,
            vec![
                (from, TestPacket::Ping { seq: 1 }),
                (from, TestPacket::Ping { seq: 2 })
            ]
        );
    }

    #[tokio::test]
    async fn test_send_without_target_is_skipped() {
        let channel: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        assert!(!channel.send(&TestPacket::Ping { seq: 1 }).await);
    }

    #[tokio::test]
    async fn test_unexpected_sender_is_filtered() {
        let mut config = loopback();
        config.expected_sender = Some("10.255.255.1".parse().unwrap());
        let receiver: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&config, slot()).unwrap();
        let target = receiver.local_addr().unwrap();

        let sender: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        assert!(sender.send_to(&TestPacket::Ping { seq: 1 }, target).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(receiver.drain().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_dropped() {
        let receiver: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        let target = receiver.local_addr().unwrap();

        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0xFF, 0xFF, 0xFF], target).await.unwrap();
        raw.send_to(&[], target).await.unwrap();

        let sender: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        sender.send_to(&TestPacket::Pong { seq: 9 }, target).await;

        let mut received = Vec::new();
        assert!(
            wait_until(Duration::from_secs(2), || {
                received.extend(receiver.drain());
                !received.is_empty()
            })
            .await
        );
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, TestPacket::Pong { seq: 9 });
    }

    #[tokio::test]
    async fn test_close_stops_receiving() {
        let receiver: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        let target = receiver.local_addr().unwrap();
        receiver.close().await;
        receiver.close().await;

        let sender: UdpChannel<TestPacket, TestPacket> =
            UdpChannel::bind(&loopback(), slot()).unwrap();
        sender.send_to(&TestPacket::Ping { seq: 1 }, target).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(receiver.drain().is_empty());
    }
}
