//! Class numbering scheme and the per-peer shaping class.
//!
//! The hierarchy installed on the egress interface looks like this:
//!
//! ```text
//! 1: htb (root, default 1:99)
//! ├── 1:1  rate = ceil = effective bandwidth
//! │   ├── 1:11  peer class, netem 11: below it
//! │   ├── 1:12  peer class, netem 12: below it
//! │   └── ...
//! └── 1:99 default class, unimpaired
//! ```
//!
//! Peer classes are assigned sequentially from [`FIRST_PEER_CLASS`] in increasing peer order,
//! so the same peer may land on a different class id after a reconfiguration.
//!
//! NOTE: `tc` reads handle numbers as hexadecimal. Class ids are kept as plain integers here and
//! formatted with [`fmt_class`] / [`fmt_qdisc`] when building commands.

use manet_model::{LinkQuality, NodeId};
use serde::Serialize;

/// Major number of the root qdisc.
pub const ROOT_MAJOR: u32 = 1;

/// Minor of the parent class carrying the interface-wide bandwidth cap.
pub const ROOT_CLASS: u32 = 1;

/// Minor of the unimpaired class for unmatched traffic.
pub const DEFAULT_CLASS: u32 = 99;

/// Offset between a class id and its filter priority.
pub const ID_OFFSET: u32 = 10;

/// First class id handed out to a peer.
pub const FIRST_PEER_CLASS: u32 = ID_OFFSET + 1;

/// Peer classes must stay below [`DEFAULT_CLASS`].
pub const MAX_PEER_CLASSES: usize = (DEFAULT_CLASS - FIRST_PEER_CLASS) as usize;

/// Minimum guaranteed rate of a peer class, in kbit/s.
pub const CLASS_RATE_FLOOR_KBPS: u64 = 10;

/// Minimum jitter applied together with any non-zero delay, in microseconds.
pub const MIN_JITTER_US: u64 = 1_000;

/// Class id for the peer at `slot` in increasing peer order.
pub const fn class_for_slot(slot: usize) -> u32 {
    FIRST_PEER_CLASS + slot as u32
}

/// Filter priority of the steering rule that targets `class_id`.
pub const fn filter_prio(class_id: u32) -> u32 {
    class_id - ID_OFFSET
}

/// Formats `1:<minor>` in the notation `tc` expects.
pub fn fmt_class(minor: u32) -> String {
    format!("{ROOT_MAJOR:x}:{minor:x}")
}

/// Formats the `<major>:` handle of a qdisc.
pub fn fmt_qdisc(major: u32) -> String {
    format!("{major:x}:")
}

/// Parses a `major:minor` handle as printed by `tc`, returning the minor of root classes.
pub fn parse_class(handle: &str) -> Option<u32> {
    let (major, minor) = handle.split_once(':')?;
    if u32::from_str_radix(major, 16).ok()? != ROOT_MAJOR {
        return None;
    }

    u32::from_str_radix(minor, 16).ok()
}

/// Everything needed to install the class, emulation stage and steering rule for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShapingClass {
    /// Minor number of the class under the root class.
    pub class_id: u32,
    /// The peer whose traffic this class shapes.
    pub peer: NodeId,
    /// Guaranteed rate, in kbit/s.
    pub rate_kbps: u64,
    /// Rate ceiling, in kbit/s.
    pub ceil_kbps: u64,
    /// One-way delay, in microseconds.
    pub delay_us: u64,
    /// Delay variation, in microseconds.
    pub jitter_us: u64,
    /// Packet loss, in percent.
    pub loss_percent: f64,
}

impl ShapingClass {
    /// Derives the class for `peer` from its link quality and the effective bandwidth.
    ///
    /// Unreachable links keep their class but drop every packet.
    pub fn for_link(class_id: u32, peer: NodeId, quality: &LinkQuality, bandwidth_kbps: u64) -> Self {
        let (delay_us, loss_percent) = if quality.drops_everything() {
            (0, 100.0)
        } else {
            ((quality.latency_ms.max(0.0) * 1000.0).round() as u64, quality.loss_percent.max(0.0))
        };

        let jitter_us = if delay_us > 0 { (delay_us / 10).max(MIN_JITTER_US) } else { 0 };

        Self {
            class_id,
            peer,
            rate_kbps: CLASS_RATE_FLOOR_KBPS.min(bandwidth_kbps),
            ceil_kbps: bandwidth_kbps,
            delay_us,
            jitter_us,
            loss_percent,
        }
    }

    /// Returns `true` if this class needs an emulation stage at all.
    pub fn has_emulation(&self) -> bool {
        self.delay_us > 0 || self.loss_percent > 0.0
    }
}
