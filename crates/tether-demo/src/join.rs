//! Client role: pings the host and reports round-trip times.

use std::time::{Duration, Instant};

use tether_config::Config;
use tether_net::{ClientHandler, ConnectionState, GameClient};
use tracing::{debug, info, warn};

use crate::protocol::{DemoPacket, DemoPipeline};
use crate::settings::{self, ServerTarget};
use crate::{DemoError, PUMP_INTERVAL};

type DemoClient = GameClient<DemoPacket, DemoPacket>;

struct JoinHandler {
    started: Instant,
    round_trips: Vec<u64>,
}

impl JoinHandler {
    fn new(started: Instant) -> Self {
        Self {
            started,
            round_trips: Vec::new(),
        }
    }
}

impl ClientHandler<DemoPacket> for JoinHandler {
    fn on_packet(&mut self, packet: DemoPacket) {
        match packet {
            DemoPacket::Welcome { motd } => info!(motd, "Joined"),
            DemoPacket::Pong { seq, sent_ms } => {
                let rtt_ms = elapsed_ms(self.started).saturating_sub(sent_ms);
                self.round_trips.push(rtt_ms);
                info!(seq, rtt_ms, "Pong");
            }
            other => debug!(?other, "Ignoring packet"),
        }
    }

    fn on_unreliable_packet(&mut self, packet: DemoPacket) {
        if let DemoPacket::Tick { frame, clients } = packet {
            debug!(frame, clients, "Host tick");
        }
    }

    fn on_connection_lost(&mut self) {
        warn!("Connection lost");
    }

    fn on_connection_repaired(&mut self, transition: Duration) {
        info!(?transition, "Connection repaired");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn connect(client: &DemoClient, config: &Config) {
    match settings::server_target(config) {
        ServerTarget::Addr(addr) => client.connect(addr).await,
        ServerTarget::Host(host, port) => client.connect_host(&host, port).await,
    }
}

pub async fn run(config: &Config, pipeline: DemoPipeline, name: String) -> Result<(), DemoError> {
    let client: DemoClient = GameClient::new(settings::client_config(config), pipeline);
    client.set_handshake(Some(DemoPacket::Hello { name }));

    if let Some(mut udp) = settings::udp_config(config)? {
        // Clients only listen on the group.
        udp.target = None;
        if let ServerTarget::Addr(addr) = settings::server_target(config) {
            udp.expected_sender = Some(addr.ip());
        }
        client.attach_udp(&udp)?;
    }

    connect(&client, config).await;

    let started = Instant::now();
    let mut handler = JoinHandler::new(started);
    let heartbeat_every = config.network.heartbeat_interval();
    let mut last_heartbeat = Instant::now();
    let mut ticker = tokio::time::interval(PUMP_INTERVAL);
    let mut seq = 0u32;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        client.fire_events(&mut handler);

        if last_heartbeat.elapsed() < heartbeat_every {
            continue;
        }
        last_heartbeat = Instant::now();

        if client.state() == ConnectionState::Disconnected {
            info!("Reconnecting");
            connect(&client, config).await;
            continue;
        }
        if client.heartbeat_connection(config.network.auto_repair).await {
            seq = seq.wrapping_add(1);
            let ping = DemoPacket::Ping {
                seq,
                sent_ms: elapsed_ms(started),
            };
            client.send_packet(&ping).await;
        }
    }

    if !handler.round_trips.is_empty() {
        let total: u64 = handler.round_trips.iter().sum();
        info!(
            pongs = handler.round_trips.len(),
            avg_rtt_ms = total / handler.round_trips.len() as u64,
            "Session summary"
        );
    }
    client.disconnect().await;
    Ok(())
}
