//! Topology resolution: which peers a node has live shaping rules for.

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Node id reserved for the hub ("base station").
pub const HUB_ID: NodeId = 0;

/// How nodes are allowed to talk to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Every participant reaches every other participant directly.
    #[default]
    Mesh,
    /// All traffic goes through the hub.
    Star,
}

impl TopologyMode {
    /// The wire name of this mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mesh => "mesh",
            Self::Star => "star",
        }
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown topology mode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topology: {0}")]
pub struct UnknownTopology(pub String);

impl FromStr for TopologyMode {
    type Err = UnknownTopology;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mesh" => Ok(Self::Mesh),
            "star" => Ok(Self::Star),
            other => Err(UnknownTopology(other.to_string())),
        }
    }
}

/// The set of simulated nodes: the hub plus participants `1..=node_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    node_count: NodeId,
}

impl Topology {
    /// A topology with `node_count` participants (the hub is always implied).
    pub const fn new(node_count: NodeId) -> Self {
        Self { node_count }
    }

    /// Number of participants, excluding the hub.
    pub const fn node_count(&self) -> NodeId {
        self.node_count
    }

    /// Returns `true` if `id` is the hub or one of the participants.
    pub const fn contains(&self, id: NodeId) -> bool {
        id <= self.node_count
    }

    /// Every node other than `self_id`, hub included. Link quality is kept for all of them so
    /// that topology switches and overrides always find pre-computed data.
    pub fn universe(&self, self_id: NodeId) -> impl Iterator<Item = NodeId> {
        (HUB_ID..=self.node_count).filter(move |id| *id != self_id)
    }

    /// The peers that must have a live shaping rule on `self_id` under `mode`.
    ///
    /// - Mesh: every other participant. The hub is never a mesh peer.
    /// - Star: the hub sees every participant, participants only see the hub.
    pub fn peers_for(&self, self_id: NodeId, mode: TopologyMode) -> BTreeSet<NodeId> {
        match mode {
            TopologyMode::Mesh => (1..=self.node_count).filter(|id| *id != self_id).collect(),
            TopologyMode::Star if self_id == HUB_ID => (1..=self.node_count).collect(),
            TopologyMode::Star => BTreeSet::from([HUB_ID]),
        }
    }
}
