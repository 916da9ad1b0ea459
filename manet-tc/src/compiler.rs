use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::Arc,
};

use manet_model::{LinkQuality, NodeId};
use parking_lot::RwLock;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::{
    backend::{BackendError, SchedulerBackend},
    class::{self, MAX_PEER_CLASSES},
    ShapingClass,
};

/// Maps installed class ids to the peer they shape.
///
/// Written by the [`RuleCompiler`] on every reconfiguration, read by the traffic tracker.
pub type ClassMap = Arc<RwLock<BTreeMap<u32, NodeId>>>;

/// A peer that must have a live shaping rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkPlan {
    pub peer: NodeId,
    pub destination: Ipv4Addr,
    pub quality: LinkQuality,
}

/// Outcome of a successful reconfiguration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileReport {
    /// Effective bandwidth the root class was capped at.
    pub bandwidth_kbps: u64,
    /// Classes that were fully installed.
    pub classes: Vec<ShapingClass>,
    /// Peers whose rules could not be installed. Their traffic falls into the default class.
    pub failed: BTreeSet<NodeId>,
}

/// Errors that leave the interface without a usable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ShapingError {
    #[error("failed to install the root configuration: {0}")]
    Root(#[source] BackendError),
    #[error("{0} peers exceed the {MAX_PEER_CLASSES} available classes")]
    TooManyPeers(usize),
}

/// Rebuilds the whole shaping hierarchy from scratch on every call.
///
/// Each call tears down everything, caps the interface at the effective bandwidth and installs
/// one class, emulation stage and steering rule per peer. A peer whose steps fail is skipped;
/// a failure to reset or cap the interface is retried once before giving up.
#[derive(Debug)]
pub struct RuleCompiler {
    backend: Arc<dyn SchedulerBackend>,
    classes: ClassMap,
    generation: u64,
}

impl RuleCompiler {
    pub fn new(backend: Arc<dyn SchedulerBackend>) -> Self {
        Self { backend, classes: ClassMap::default(), generation: 0 }
    }

    /// Shared view of the installed classes.
    pub fn class_map(&self) -> ClassMap {
        Arc::clone(&self.classes)
    }

    pub fn backend(&self) -> &Arc<dyn SchedulerBackend> {
        &self.backend
    }

    /// Number of reconfigurations attempted so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replaces the installed configuration with one class per link in `links`.
    ///
    /// Classes are numbered in increasing peer order. Duplicate peers keep their first plan.
    pub async fn apply(
        &mut self,
        bandwidth_kbps: u64,
        links: &[LinkPlan],
    ) -> Result<CompileReport, ShapingError> {
        self.generation += 1;
        let span = info_span!("compile", generation = self.generation, bandwidth_kbps, peers = links.len());
        self.apply_inner(bandwidth_kbps.max(1), links).instrument(span).await
    }

    async fn apply_inner(
        &mut self,
        bandwidth_kbps: u64,
        links: &[LinkPlan],
    ) -> Result<CompileReport, ShapingError> {
        let mut ordered: BTreeMap<NodeId, &LinkPlan> = BTreeMap::new();
        for link in links {
            ordered.entry(link.peer).or_insert(link);
        }

        if ordered.len() > MAX_PEER_CLASSES {
            return Err(ShapingError::TooManyPeers(ordered.len()));
        }

        self.classes.write().clear();

        if let Err(e) = self.install_root(bandwidth_kbps).await {
            warn!(error = %e, "root configuration failed, resynchronizing");
            if let Err(e) = self.install_root(bandwidth_kbps).await {
                error!(error = %e, "resynchronization failed");
                return Err(ShapingError::Root(e));
            }
        }

        let mut report = CompileReport { bandwidth_kbps, ..Default::default() };
        for (slot, (peer, link)) in ordered.into_iter().enumerate() {
            let class = ShapingClass::for_link(class::class_for_slot(slot), peer, &link.quality, bandwidth_kbps);

            match self.install_link(&class, link.destination).await {
                Ok(()) => {
                    debug!(peer, class_id = class.class_id, delay_us = class.delay_us, loss = class.loss_percent, "installed link");
                    report.classes.push(class);
                }
                Err(e) => {
                    warn!(peer, class_id = class.class_id, error = %e, "failed to install link, skipping peer");
                    report.failed.insert(peer);
                }
            }
        }

        Ok(report)
    }

    async fn install_root(&self, bandwidth_kbps: u64) -> Result<(), BackendError> {
        self.backend.reset_interface().await?;
        self.backend.set_root_cap(bandwidth_kbps).await
    }

    async fn install_link(&self, class: &ShapingClass, destination: Ipv4Addr) -> Result<(), BackendError> {
        self.backend.add_class(class).await?;
        self.classes.write().insert(class.class_id, class.peer);

        if class.has_emulation() {
            self.backend.add_emulation_stage(class).await?;
        }

        self.backend.add_steering_rule(class, destination).await
    }
}
