//! Parsers for the raw counters exposed by the kernel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::class;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("interface {0} not found")]
    MissingInterface(String),
    #[error("malformed counters for interface {interface}: {line}")]
    MalformedInterface { interface: String, line: String },
    #[error("invalid class statistics: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a list of classes")]
    NotAList,
}

/// Cumulative counters of a network interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Cumulative counters of a single scheduler class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounters {
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
}

/// One reading of every counter the traffic tracker cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub interface: InterfaceCounters,
    /// Keyed by class id.
    pub classes: BTreeMap<u32, ClassCounters>,
}

/// Parses the `/proc/net/dev` table and returns the counters of `interface`.
pub fn parse_net_dev(contents: &str, interface: &str) -> Result<InterfaceCounters, ParseError> {
    let line = contents
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim() == interface)
        .ok_or_else(|| ParseError::MissingInterface(interface.to_string()))?
        .1;

    let fields = line.split_whitespace().map(str::parse::<u64>).collect::<Result<Vec<_>, _>>();
    match fields.as_deref() {
        Ok([rx_bytes, rx_packets, _, _, _, _, _, _, tx_bytes, tx_packets, ..]) => Ok(InterfaceCounters {
            rx_bytes: *rx_bytes,
            rx_packets: *rx_packets,
            tx_bytes: *tx_bytes,
            tx_packets: *tx_packets,
        }),
        _ => Err(ParseError::MalformedInterface {
            interface: interface.to_string(),
            line: line.trim().to_string(),
        }),
    }
}

/// Parses the JSON output of `tc -s -j class show`.
///
/// Statistics are read from a nested `stats` object when present and from the class object
/// itself otherwise. Classes outside the root hierarchy are skipped.
pub fn parse_class_stats(json: &str) -> Result<BTreeMap<u32, ClassCounters>, ParseError> {
    let value: Value = serde_json::from_str(json)?;
    let classes = value.as_array().ok_or(ParseError::NotAList)?;

    let mut counters = BTreeMap::new();
    for entry in classes {
        let Some(class_id) = entry.get("handle").and_then(Value::as_str).and_then(class::parse_class)
        else {
            continue;
        };

        let stats = entry.get("stats").filter(|s| s.is_object()).unwrap_or(entry);
        let read = |key: &str| stats.get(key).and_then(Value::as_u64).unwrap_or(0);

        counters.insert(
            class_id,
            ClassCounters { bytes: read("bytes"), packets: read("packets"), dropped: read("drops") },
        );
    }

    Ok(counters)
}
