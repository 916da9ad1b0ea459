//! Rates derived from cumulative counters.

use std::{
    collections::{BTreeMap, BTreeSet},
    hash::Hash,
    sync::Arc,
    time::Instant,
};

use manet_model::NodeId;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::{
    backend::{BackendError, SchedulerBackend},
    compiler::ClassMap,
    stats::Counters,
};

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: u64,
    at: Instant,
}

/// Turns successive readings of cumulative counters into per-second rates.
///
/// A counter that goes backwards (interface reset, class recreated) is rebased at zero, so the
/// new value is the whole delta. Rates are never negative.
#[derive(Debug, Clone)]
pub struct RateTracker<K> {
    previous: FxHashMap<K, Sample>,
}

impl<K> Default for RateTracker<K> {
    fn default() -> Self {
        Self { previous: FxHashMap::default() }
    }
}

impl<K: Hash + Eq + Copy + std::fmt::Debug> RateTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for `key` at `at` and returns the rate since the previous reading.
    /// The first reading of a key yields zero.
    pub fn observe(&mut self, key: K, value: u64, at: Instant) -> f64 {
        let rate = match self.previous.get(&key) {
            None => 0.0,
            Some(prev) => {
                let elapsed = at.saturating_duration_since(prev.at).as_secs_f64();
                if elapsed <= 0.0 {
                    return 0.0;
                }

                let base = if value < prev.value {
                    debug!(?key, previous = prev.value, current = value, "counter went backwards");
                    0
                } else {
                    prev.value
                };

                (value - base) as f64 / elapsed
            }
        };

        self.previous.insert(key, Sample { value, at });
        rate
    }

    /// Drops the history of every key not matching `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.previous.retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// Interface-wide traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InterfaceTraffic {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_bytes_sec: f64,
    pub rx_bytes_sec: f64,
    pub tx_packets_sec: f64,
    pub rx_packets_sec: f64,
    /// Share of the effective bandwidth in use, in percent, capped at 100.
    pub load_percent: f64,
}

/// Egress traffic towards a single peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LinkTraffic {
    pub class_id: u32,
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
    pub bytes_sec: f64,
    pub packets_sec: f64,
    pub dropped_sec: f64,
}

/// One traffic sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficSnapshot {
    pub interface: InterfaceTraffic,
    pub links: BTreeMap<NodeId, LinkTraffic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Counter {
    TxBytes,
    RxBytes,
    TxPackets,
    RxPackets,
    Bytes,
    Packets,
    Dropped,
}

/// Counters are tracked per interface and per (class, peer): a class id reassigned to another
/// peer starts a fresh history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RateKey {
    Interface(Counter),
    Class { class_id: u32, peer: NodeId, counter: Counter },
}

/// Computes the percentage of the effective bandwidth used by `tx + rx` bytes per second,
/// capped at 100 and rounded to one decimal.
pub fn load_percent(tx_bytes_sec: f64, rx_bytes_sec: f64, bandwidth_kbps: u64) -> f64 {
    if bandwidth_kbps == 0 {
        return 0.0;
    }

    let capacity = bandwidth_kbps as f64 * 1000.0 / 8.0;
    let load = (100.0 * (tx_bytes_sec + rx_bytes_sec) / capacity).min(100.0);
    (load * 10.0).round() / 10.0
}

/// Periodically samples the scheduler counters of the installed classes.
#[derive(Debug)]
pub struct TrafficTracker {
    backend: Arc<dyn SchedulerBackend>,
    classes: ClassMap,
    rates: RateTracker<RateKey>,
}

impl TrafficTracker {
    pub fn new(backend: Arc<dyn SchedulerBackend>, classes: ClassMap) -> Self {
        Self { backend, classes, rates: RateTracker::new() }
    }

    /// Reads the counters now and derives rates against `bandwidth_kbps`.
    pub async fn sample(&mut self, bandwidth_kbps: u64) -> Result<TrafficSnapshot, BackendError> {
        let counters = self.backend.read_counters().await?;
        Ok(self.record(&counters, bandwidth_kbps, Instant::now()))
    }

    /// Derives a snapshot from a counter reading taken at `at`.
    pub fn record(&mut self, counters: &Counters, bandwidth_kbps: u64, at: Instant) -> TrafficSnapshot {
        let iface = counters.interface;
        let mut rate = |counter, value| self.rates.observe(RateKey::Interface(counter), value, at);

        let tx_bytes_sec = rate(Counter::TxBytes, iface.tx_bytes);
        let rx_bytes_sec = rate(Counter::RxBytes, iface.rx_bytes);
        let interface = InterfaceTraffic {
            tx_bytes: iface.tx_bytes,
            rx_bytes: iface.rx_bytes,
            tx_packets: iface.tx_packets,
            rx_packets: iface.rx_packets,
            tx_bytes_sec,
            rx_bytes_sec,
            tx_packets_sec: rate(Counter::TxPackets, iface.tx_packets),
            rx_packets_sec: rate(Counter::RxPackets, iface.rx_packets),
            load_percent: load_percent(tx_bytes_sec, rx_bytes_sec, bandwidth_kbps),
        };

        let installed = self.classes.read().clone();
        let mut links = BTreeMap::new();
        for (&class_id, &peer) in &installed {
            let Some(class) = counters.classes.get(&class_id) else {
                continue;
            };

            let mut rate = |counter, value| {
                self.rates.observe(RateKey::Class { class_id, peer, counter }, value, at)
            };

            links.insert(
                peer,
                LinkTraffic {
                    class_id,
                    bytes: class.bytes,
                    packets: class.packets,
                    dropped: class.dropped,
                    bytes_sec: rate(Counter::Bytes, class.bytes),
                    packets_sec: rate(Counter::Packets, class.packets),
                    dropped_sec: rate(Counter::Dropped, class.dropped),
                },
            );
        }

        let live: BTreeSet<(u32, NodeId)> = installed.into_iter().collect();
        self.rates.retain(|key| match key {
            RateKey::Interface(_) => true,
            RateKey::Class { class_id, peer, .. } => live.contains(&(*class_id, *peer)),
        });

        TrafficSnapshot { interface, links }
    }
}
