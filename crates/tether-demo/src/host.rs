//! Host role: accepts named clients, answers pings, announces ticks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tether_config::Config;
use tether_net::{Approval, ConnectionId, GameServer, ServerHandler};
use tracing::{debug, info, warn};

use crate::protocol::{DemoPacket, DemoPipeline};
use crate::{DemoError, PUMP_INTERVAL, settings};

/// Collects replies during a pump; they are sent once the pump returns.
#[derive(Default)]
struct HostHandler {
    replies: Vec<(ConnectionId, DemoPacket)>,
}

impl ServerHandler<DemoPacket> for HostHandler {
    fn on_packet(&mut self, id: ConnectionId, packet: DemoPacket) {
        match packet {
            DemoPacket::Ping { seq, sent_ms } => {
                self.replies.push((id, DemoPacket::Pong { seq, sent_ms }));
            }
            other => debug!(%id, ?other, "Ignoring packet"),
        }
    }

    fn on_client_connected(&mut self, id: ConnectionId, addr: SocketAddr) {
        info!(%id, %addr, "Client joined");
    }

    fn on_client_disconnected(&mut self, id: ConnectionId) {
        info!(%id, "Client left");
    }

    fn on_connection_lost(&mut self, id: ConnectionId) {
        warn!(%id, "Client lost");
    }
}

fn approve(handshake: &DemoPacket, addr: SocketAddr) -> Approval<DemoPacket> {
    match handshake {
        DemoPacket::Hello { name } if !name.trim().is_empty() => {
            info!(%addr, name, "Handshake accepted");
            Approval::Accept(Some(DemoPacket::Welcome {
                motd: format!("welcome, {name}"),
            }))
        }
        other => Approval::Deny(format!("expected a named Hello, got {other:?}")),
    }
}

pub async fn run(config: &Config, pipeline: DemoPipeline) -> Result<(), DemoError> {
    let server = GameServer::new(settings::server_config(config), pipeline);
    server.set_approver(Arc::new(approve));

    let addr = server.host().await?;
    info!(%addr, "Hosting");

    let udp = settings::udp_config(config)?;
    if let Some(udp) = &udp {
        let local = server.attach_udp(udp)?;
        info!(%local, group = ?udp.multicast_group, "Announcing ticks");
    }

    let heartbeat_every = config.network.heartbeat_interval();
    let mut last_heartbeat = Instant::now();
    let mut ticker = tokio::time::interval(PUMP_INTERVAL);
    let mut frame = 0u64;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        frame += 1;

        let mut handler = HostHandler::default();
        server.fire_events(&mut handler);
        for (id, reply) in handler.replies {
            server.send_packet(&reply, &[id]).await;
        }

        if last_heartbeat.elapsed() < heartbeat_every {
            continue;
        }
        last_heartbeat = Instant::now();

        let evicted = server.heartbeat_connections().await;
        if evicted > 0 {
            warn!(evicted, "Evicted unresponsive clients");
        }
        if udp.is_some() {
            let clients = u32::try_from(server.connection_count()).unwrap_or(u32::MAX);
            server
                .send_unreliable(&DemoPacket::Tick { frame, clients })
                .await;
        }
    }

    info!("Shutting down host");
    server.close().await;
    Ok(())
}
