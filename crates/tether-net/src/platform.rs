//! Socket setup and the cheap liveness probe.
//!
//! Everything that touches raw socket options goes through `socket2` here so
//! the session code only deals with tokio types.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// TCP socket options applied to every session transport.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 10s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 2s.
    pub keepalive_interval: Duration,
    /// Probes before the kernel declares the peer dead. Default: 3.
    pub keepalive_retries: u32,
    /// `SO_REUSEADDR` on listeners and bound client sockets. Default: true
    /// except on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply socket configuration to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a listening socket with `SO_REUSEADDR` and dual-stack IPv6.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

/// Open a configured TCP connection to `addr`.
///
/// With `local_port` set, the socket is bound to that port on the unspecified
/// address of the matching family before connecting.
pub async fn connect_stream(
    addr: SocketAddr,
    local_port: Option<u16>,
    config: &SocketConfig,
) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(port) = local_port {
        if config.reuse_addr {
            socket.set_reuseaddr(true)?;
        }
        let local_ip = if addr.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        socket.bind(SocketAddr::new(local_ip, port))?;
    }

    let stream = socket.connect(addr).await?;
    configure_stream(&stream, config)?;
    Ok(stream)
}

/// Result of a non-blocking liveness check.
#[derive(Debug)]
pub enum Liveness {
    /// No pending error and the peer has not closed.
    Alive,
    /// The peer closed its side.
    Closed,
    /// The socket carries an error.
    Faulted(std::io::Error),
}

impl Liveness {
    /// Whether the transport is still usable.
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// Check a connected stream without a network round trip.
///
/// Reads `SO_ERROR`, then peeks one byte without blocking: pending data or
/// `WouldBlock` mean alive, a zero-length peek means the peer closed.
pub fn probe_liveness(stream: &TcpStream) -> Liveness {
    let sock = SockRef::from(stream);
    match sock.take_error() {
        Ok(None) => {}
        Ok(Some(e)) | Err(e) => return Liveness::Faulted(e),
    }

    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match sock.peek(&mut buf) {
        Ok(0) => Liveness::Closed,
        Ok(_) => Liveness::Alive,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Liveness::Alive
        }
        Err(e) => Liveness::Faulted(e),
    }
}

/// Bind a UDP socket, optionally joining an IPv4 multicast group.
///
/// Address reuse is enabled so several processes on one host can share a
/// multicast port.
pub fn bind_udp(addr: SocketAddr, group: Option<Ipv4Addr>) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    if let Some(group) = group {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
    } else if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }

    UdpSocket::from_std(socket.into())
}
