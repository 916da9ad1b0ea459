#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! # Radio sidecar
//!
//! One process per simulated node. It owns the node's link model and the shaping rules on its
//! egress interface, probes its peers, samples delivered traffic and exposes a control-plane API.
//!
//! - [`state`]: the single-writer state actor; every mutation recompiles the shaping rules.
//! - [`prober`] and [`listener`]: active connectivity checks and the responders for them.
//! - [`api`]: the axum router.
//! - [`node`]: wiring of all of the above into a running node.

use std::{io, net::SocketAddr};

use manet_model::{ConfigError, NodeId};

pub mod actor;
pub mod api;
pub mod listener;
pub mod metrics;
pub mod node;
pub mod prober;
pub mod state;
pub mod telemetry;

pub use node::{NodeOptions, RunningNode};
pub use state::{Snapshot, StateError, StateHandle};

/// Startup failures. Once a node runs, nothing is fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("node id {id} is outside 0..={count}")]
    NodeId { id: NodeId, count: NodeId },
    #[error("node {id} would shape {peers} peers, at most {max} are supported")]
    TooManyPeers { id: NodeId, peers: usize, max: usize },
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[source] io::Error),
}
