use log::warn;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::SystemTime;

use crate::error::Result;
use crate::mqtt::QoS;

/// Instruments updated by the coordinator, one registry per broker instance.
#[derive(Clone)]
pub struct BrokerMetrics {
    registry: Registry,
    connected_clients: IntGauge,
    received_packets: IntCounter,
    rejected_connections: IntCounter,
    qos0_delivery_time: Histogram,
    qos1_delivery_time: Histogram,
    qos2_delivery_time: Histogram,
}

impl BrokerMetrics {
    pub fn new() -> Result<BrokerMetrics> {
        let res = BrokerMetrics {
            registry: Registry::new(),
            connected_clients: IntGauge::new("connected_clients", "active connected clients")?,
            received_packets: IntCounter::new("received_packets", "counts total packets")?,
            rejected_connections: IntCounter::new(
                "rejected_connections",
                "connect attempts that were refused",
            )?,
            qos0_delivery_time: Histogram::with_opts(HistogramOpts::new(
                "qos0_delivery_time",
                "histogram of delivery times for qos0",
            ))?,
            qos1_delivery_time: Histogram::with_opts(HistogramOpts::new(
                "qos1_delivery_time",
                "histogram of delivery times for qos1",
            ))?,
            qos2_delivery_time: Histogram::with_opts(HistogramOpts::new(
                "qos2_delivery_time",
                "histogram of delivery times for qos2",
            ))?,
        };

        res.registry
            .register(Box::new(res.connected_clients.clone()))?;
        res.registry
            .register(Box::new(res.received_packets.clone()))?;
        res.registry
            .register(Box::new(res.rejected_connections.clone()))?;
        res.registry
            .register(Box::new(res.qos0_delivery_time.clone()))?;
        res.registry
            .register(Box::new(res.qos1_delivery_time.clone()))?;
        res.registry
            .register(Box::new(res.qos2_delivery_time.clone()))?;

        Ok(res)
    }

    pub fn connected(&self) {
        self.connected_clients.inc();
    }

    pub fn disconnected(&self) {
        self.connected_clients.dec();
    }

    pub fn packet(&self) {
        self.received_packets.inc();
    }

    pub fn rejected(&self) {
        self.rejected_connections.inc();
    }

    /// Records the time between the broker receiving a publish and handing it
    /// to a subscriber connection, in ms.
    pub fn delivered(&self, qos: QoS, received_at: SystemTime) {
        let duration_ms = match SystemTime::now().duration_since(received_at) {
            Ok(elapsed) => elapsed.as_secs_f64() * 1000.0,
            Err(e) => {
                warn!("[Metrics] delivery time went backwards: {}", e);
                return;
            }
        };
        match qos {
            QoS::AtMostOnce => self.qos0_delivery_time.observe(duration_ms),
            QoS::AtLeastOnce => self.qos1_delivery_time.observe(duration_ms),
            QoS::ExactlyOnce => self.qos2_delivery_time.observe(duration_ms),
        }
    }

    pub fn connected_clients(&self) -> i64 {
        self.connected_clients.get()
    }

    pub fn received_packets(&self) -> u64 {
        self.received_packets.get()
    }

    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.get()
    }

    /// Text exposition of every instrument.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_renders_instruments() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.connected();
        metrics.connected();
        metrics.disconnected();
        metrics.packet();
        metrics.rejected();
        metrics.delivered(QoS::AtLeastOnce, SystemTime::now());
        assert_eq!(metrics.connected_clients(), 1);
        let text = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(text.contains("connected_clients 1"));
        assert!(text.contains("received_packets 1"));
        assert!(text.contains("rejected_connections 1"));
        assert!(text.contains("qos1_delivery_time_count 1"));
    }
}
