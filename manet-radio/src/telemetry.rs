//! Latest probe results and traffic sample, shared between the loops and the API.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use manet_model::{LinkQuality, NodeId};
use manet_tc::{InterfaceTraffic, LinkTraffic, TrafficSnapshot};
use parking_lot::RwLock;
use serde::Serialize;

use crate::{prober::Probe, state::Snapshot};

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
}

/// What a probe measured towards one peer, next to what the model expected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeResult {
    /// Echo round-trip in milliseconds, `-1` if unreachable.
    pub ping_ms: f64,
    pub tcp_ok: bool,
    pub udp_ok: bool,
    pub distance_m: f64,
    pub expected_latency_ms: f64,
    pub expected_loss_percent: f64,
    pub reachable: bool,
    pub tx_bytes_sec: f64,
    pub tx_packets_sec: f64,
    pub dropped_sec: f64,
    pub timestamp: f64,
}

impl ProbeResult {
    pub fn new(
        probe: Probe,
        quality: Option<&LinkQuality>,
        traffic: Option<&LinkTraffic>,
        timestamp: f64,
    ) -> Self {
        Self {
            ping_ms: probe.ping_ms,
            tcp_ok: probe.tcp_ok,
            udp_ok: probe.udp_ok,
            distance_m: quality.map_or(0.0, |q| q.distance_m),
            expected_latency_ms: quality.map_or(0.0, |q| q.latency_ms),
            expected_loss_percent: quality.map_or(0.0, |q| q.loss_percent),
            reachable: quality.map_or(true, |q| q.reachable),
            tx_bytes_sec: traffic.map_or(0.0, |t| t.bytes_sec),
            tx_packets_sec: traffic.map_or(0.0, |t| t.packets_sec),
            dropped_sec: traffic.map_or(0.0, |t| t.dropped_sec),
            timestamp,
        }
    }
}

/// Measurements produced outside the state actor.
#[derive(Debug, Default)]
pub struct Telemetry {
    probes: RwLock<BTreeMap<NodeId, ProbeResult>>,
    traffic: RwLock<TrafficSnapshot>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the results of the previous probe cycle.
    pub fn set_probes(&self, probes: BTreeMap<NodeId, ProbeResult>) {
        *self.probes.write() = probes;
    }

    pub fn probes(&self) -> BTreeMap<NodeId, ProbeResult> {
        self.probes.read().clone()
    }

    pub fn set_traffic(&self, traffic: TrafficSnapshot) {
        *self.traffic.write() = traffic;
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.traffic.read().clone()
    }
}

/// Everything a node reports about itself, on `/status` and in the metrics record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub position: manet_model::Position,
    pub environment: String,
    pub topology: manet_model::TopologyMode,
    pub bandwidth_kbps: u64,
    pub peers: Vec<NodeId>,
    pub probes: BTreeMap<NodeId, ProbeResult>,
    pub link_quality: BTreeMap<NodeId, LinkQuality>,
    pub link_overrides: BTreeMap<NodeId, manet_model::LinkOverride>,
    pub link_traffic: BTreeMap<NodeId, LinkTraffic>,
    pub traffic: InterfaceTraffic,
}

impl NodeReport {
    pub fn collect(snapshot: &Snapshot, telemetry: &Telemetry) -> Self {
        let traffic = telemetry.traffic();
        Self {
            node_id: snapshot.node_id,
            position: snapshot.position,
            environment: snapshot.environment.clone(),
            topology: snapshot.topology,
            bandwidth_kbps: snapshot.bandwidth_kbps,
            peers: snapshot.peers.iter().copied().collect(),
            probes: telemetry.probes(),
            link_quality: snapshot.link_quality.clone(),
            link_overrides: snapshot.link_overrides.clone(),
            link_traffic: traffic.links,
            traffic: traffic.interface,
        }
    }
}
