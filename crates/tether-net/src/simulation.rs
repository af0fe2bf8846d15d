//! Network condition simulation as a pipeline decorator.
//!
//! [`SimulatedPipeline`] wraps any [`PipelineStrategy`] and adds artificial
//! receive lag, random receive loss and traffic counters. Output for frames
//! that are not dropped is exactly what the wrapped strategy produces.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::pipeline::{PipelineError, PipelineStrategy};

/// Knobs for the simulated network.
#[derive(Debug, Clone, Default)]
pub struct SimulationSettings {
    /// Delay applied before each received frame is converted.
    pub lag: Duration,
    /// Percentage (0-100) of received frames silently dropped.
    pub drop_percent: u8,
    /// Log every converted packet at `trace` level.
    pub full_log: bool,
}

/// Snapshot of traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Payload bytes produced for sending.
    pub bytes_sent: u64,
    /// Payload bytes handed in for receiving (including dropped frames).
    pub bytes_received: u64,
    /// Packets converted for sending.
    pub packets_sent: u64,
    /// Packets delivered to the session after conversion.
    pub packets_received: u64,
    /// Frames dropped by the simulation.
    pub packets_dropped: u64,
}

/// Decorator that simulates a worse network on top of another strategy.
pub struct SimulatedPipeline<P, R, T> {
    inner: P,
    settings: SimulationSettings,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    _marker: PhantomData<fn(&T) -> R>,
}

impl<P, R, T> SimulatedPipeline<P, R, T>
where
    P: PipelineStrategy<R, T>,
{
    /// Wrap `inner` with the given settings.
    pub fn new(inner: P, settings: SimulationSettings) -> Self {
        Self {
            inner,
            settings: SimulationSettings {
                drop_percent: settings.drop_percent.min(100),
                ..settings
            },
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// Current counter values.
    pub fn stats(&self) -> TrafficStats {
        TrafficStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }

    fn should_drop(&self) -> bool {
        match self.settings.drop_percent {
            0 => false,
            pct if pct >= 100 => true,
            pct => rand::rng().random_range(0..100u8) < pct,
        }
    }
}

impl<P, R, T> PipelineStrategy<R, T> for SimulatedPipeline<P, R, T>
where
    P: PipelineStrategy<R, T>,
    R: std::fmt::Debug,
    T: std::fmt::Debug,
{
    fn convert_receive(&self, bytes: &[u8]) -> Result<Option<R>, PipelineError> {
        self.bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if self.should_drop() {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(len = bytes.len(), "Simulated drop of received frame");
            return Ok(None);
        }

        let packet = self.inner.convert_receive(bytes)?;
        if let Some(packet) = &packet {
            self.packets_received.fetch_add(1, Ordering::Relaxed);
            if self.settings.full_log {
                tracing::trace!(len = bytes.len(), ?packet, "Received packet");
            }
        }
        Ok(packet)
    }

    fn convert_send(&self, packet: &T) -> Result<Vec<u8>, PipelineError> {
        let bytes = self.inner.convert_send(packet)?;
        self.bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        if self.settings.full_log {
            tracing::trace!(len = bytes.len(), ?packet, "Sending packet");
        }
        Ok(bytes)
    }

    fn receive_delay(&self) -> Duration {
        self.settings.lag.max(self.inner.receive_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{TestPacket, test_pipeline};
    use std::sync::Arc;

    type Sim = SimulatedPipeline<Arc<crate::pipeline::DefaultPipeline>, TestPacket, TestPacket>;

    fn sim(settings: SimulationSettings) -> Sim {
        SimulatedPipeline::new(test_pipeline(), settings)
    }

    #[test]
    fn test_passthrough_matches_wrapped_strategy() {
        let pipeline = sim(SimulationSettings::default());
        let packet = TestPacket::Chat {
            from: 1,
            text: "hi".to_string(),
        };

        let bytes = pipeline.convert_send(&packet).unwrap();
        let plain = PipelineStrategy::<TestPacket, TestPacket>::convert_send(
            &test_pipeline(),
            &packet,
        )
        .unwrap();
        assert_eq!(bytes, plain);
        assert_eq!(pipeline.convert_receive(&bytes).unwrap(), Some(packet));

        let stats = pipeline.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_sent, bytes.len() as u64);
        assert_eq!(stats.bytes_received, bytes.len() as u64);
        assert_eq!(stats.packets_dropped, 0);
    }

    #[test]
    fn test_full_drop_yields_no_message() {
        let pipeline = sim(SimulationSettings {
            drop_percent: 100,
            ..Default::default()
        });
        let bytes = pipeline.convert_send(&TestPacket::Ping { seq: 1 }).unwrap();

        for _ in 0..20 {
            assert_eq!(pipeline.convert_receive(&bytes).unwrap(), None);
        }
        assert_eq!(pipeline.stats().packets_dropped, 20);
        assert_eq!(pipeline.stats().packets_received, 0);
    }

    #[test]
    fn test_drop_percent_is_clamped() {
        let pipeline = sim(SimulationSettings {
            drop_percent: 250,
            ..Default::default()
        });
        assert_eq!(pipeline.settings().drop_percent, 100);
    }

    #[test]
    fn test_lag_is_reported_as_receive_delay() {
        let pipeline = sim(SimulationSettings {
            lag: Duration::from_millis(40),
            ..Default::default()
        });
        assert_eq!(pipeline.receive_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_decode_errors_pass_through() {
        let pipeline = sim(SimulationSettings::default());
        assert!(pipeline.convert_receive(&[]).is_err());
    }
}
