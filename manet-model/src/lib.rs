#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! # Radio link model
//!
//! Pure building blocks shared by every simulated node:
//!
//! - [`geometry`]: node positions and distances.
//! - [`quality`]: the distance degradation curve, environment profiles and link overrides that
//!   together produce a [`LinkQuality`] for an ordered pair of nodes.
//! - [`topology`]: which peers a node must shape traffic for, given the topology mode.
//! - [`config`]: the typed, validated configuration loaded once at startup.

pub mod config;
pub mod geometry;
pub mod quality;
pub mod topology;

pub use config::{Config, ConfigError};
pub use geometry::Position;
pub use quality::{
    CurveError, Degradation, DistanceCurve, DistanceThreshold, EnvironmentProfile, LinkOverride,
    LinkQuality,
};
pub use topology::{Topology, TopologyMode, UnknownTopology, HUB_ID};

/// Identity of a simulated node.
///
/// `0` is reserved for the optional hub ("base station"); mesh participants are `1..=N`.
pub type NodeId = u32;
