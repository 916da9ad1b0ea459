//! Node state, owned by a single actor.
//!
//! Every mutation goes through the [`StateHandle`] mailbox and is followed by a full recompilation
//! of the shaping rules before the caller gets an answer. Reads are served from the last committed
//! [`Snapshot`], so they never wait behind a compilation.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use manet_model::{
    Config, ConfigError, DistanceCurve, EnvironmentProfile, LinkOverride, LinkQuality, NodeId,
    Position, Topology, TopologyMode,
};
use manet_tc::{ClassMap, LinkPlan, RuleCompiler, SchedulerBackend};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::actor::{self, DynFuture, Mailbox, MailboxError};

/// Requests queued beyond this are back-pressured onto the caller.
const MAILBOX_CAPACITY: usize = 64;

/// Rejected mutations. None of them change any state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("unknown profile: {0}")]
    UnknownEnvironment(String),
    #[error("invalid node id: {0}")]
    UnknownNode(NodeId),
    #[error("a node cannot override its link to itself")]
    SelfLink,
    #[error("invalid link override: latency must be >= 0 and loss within 0..=100")]
    InvalidOverride,
    #[error("position coordinates must be finite")]
    InvalidPosition,
    #[error(transparent)]
    Unavailable(#[from] MailboxError),
}

/// The last committed state of the node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub node_id: NodeId,
    pub position: Position,
    pub positions: BTreeMap<NodeId, Position>,
    pub environment: String,
    pub topology: TopologyMode,
    /// Effective bandwidth of the active environment.
    pub bandwidth_kbps: u64,
    /// Peers with a live shaping rule.
    pub peers: BTreeSet<NodeId>,
    /// Quality towards every other node, including those outside the current topology.
    pub link_quality: BTreeMap<NodeId, LinkQuality>,
    pub link_overrides: BTreeMap<NodeId, LinkOverride>,
    /// Number of compilations so far.
    pub generation: u64,
}

/// The actor context: long-lived inputs, derived quality and the rule compiler.
#[derive(Debug)]
pub struct RadioState {
    node_id: NodeId,
    topology: Topology,
    config: Arc<Config>,
    curve: DistanceCurve,

    positions: BTreeMap<NodeId, Position>,
    environment: String,
    profile: EnvironmentProfile,
    mode: TopologyMode,
    overrides: BTreeMap<NodeId, LinkOverride>,

    quality: BTreeMap<NodeId, LinkQuality>,
    peers: BTreeSet<NodeId>,

    compiler: RuleCompiler,
    published: watch::Sender<Arc<Snapshot>>,
}

impl RadioState {
    /// Builds the initial state of `node_id` from the configuration. Nothing is installed yet.
    pub fn new(
        node_id: NodeId,
        topology: Topology,
        config: Arc<Config>,
        backend: Arc<dyn SchedulerBackend>,
    ) -> Result<Self, ConfigError> {
        let curve = config.curve()?;
        let environment = config.defaults.environment.clone();
        let profile = config
            .profile(&environment)
            .copied()
            .ok_or_else(|| ConfigError::UnknownDefaultEnvironment(environment.clone()))?;

        let positions = (manet_model::HUB_ID..=topology.node_count())
            .map(|id| (id, config.initial_position(id)))
            .collect();

        let mut state = Self {
            node_id,
            topology,
            curve,
            positions,
            environment,
            profile,
            mode: config.topology.default,
            overrides: BTreeMap::new(),
            quality: BTreeMap::new(),
            peers: BTreeSet::new(),
            compiler: RuleCompiler::new(backend),
            published: watch::channel(Arc::new(Snapshot::empty(node_id))).0,
            config,
        };
        state.refresh_quality();
        state.publish();

        Ok(state)
    }

    /// Shared view of the installed classes, for the traffic tracker.
    pub fn class_map(&self) -> ClassMap {
        self.compiler.class_map()
    }

    fn bandwidth_kbps(&self) -> u64 {
        self.profile.bandwidth_kbps(self.config.radio.bandwidth_kbps)
    }

    fn position_of(&self, id: NodeId) -> Position {
        self.positions.get(&id).copied().unwrap_or(Position::ORIGIN)
    }

    /// Recomputes quality towards every node in the universe and the current peer set.
    fn refresh_quality(&mut self) {
        let own = self.position_of(self.node_id);
        self.quality = self
            .topology
            .universe(self.node_id)
            .map(|peer| {
                let quality = self.curve.link_quality(
                    &own,
                    &self.position_of(peer),
                    &self.profile,
                    self.overrides.get(&peer),
                );
                (peer, quality)
            })
            .collect();
        self.peers = self.topology.peers_for(self.node_id, self.mode);
    }

    /// Recomputes every link and replaces the installed shaping configuration.
    ///
    /// Peers whose rules could not be installed are reported down until the next compilation.
    pub async fn recompile(&mut self) -> Arc<Snapshot> {
        self.refresh_quality();

        let bandwidth_kbps = self.bandwidth_kbps();
        let plans: Vec<LinkPlan> = self
            .peers
            .iter()
            .filter_map(|peer| {
                self.quality.get(peer).map(|quality| LinkPlan {
                    peer: *peer,
                    destination: self.config.network.address_of(*peer),
                    quality: *quality,
                })
            })
            .collect();

        match self.compiler.apply(bandwidth_kbps, &plans).await {
            Ok(report) => {
                for peer in &report.failed {
                    self.mark_down(*peer);
                }
                info!(
                    bandwidth_kbps,
                    topology = %self.mode,
                    environment = %self.environment,
                    installed = report.classes.len(),
                    failed = report.failed.len(),
                    "shaping rules applied"
                );
            }
            Err(e) => {
                error!(error = %e, "shaping failed, marking every peer down");
                for peer in self.peers.clone() {
                    self.mark_down(peer);
                }
            }
        }

        self.publish()
    }

    fn mark_down(&mut self, peer: NodeId) {
        if let Some(quality) = self.quality.get_mut(&peer) {
            warn!(peer, "link down");
            *quality = quality.down();
        }
    }

    fn publish(&self) -> Arc<Snapshot> {
        let snapshot = Arc::new(self.snapshot());
        self.published.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            node_id: self.node_id,
            position: self.position_of(self.node_id),
            positions: self.positions.clone(),
            environment: self.environment.clone(),
            topology: self.mode,
            bandwidth_kbps: self.bandwidth_kbps(),
            peers: self.peers.clone(),
            link_quality: self.quality.clone(),
            link_overrides: self.overrides.clone(),
            generation: self.compiler.generation(),
        }
    }

    fn check_node(&self, id: NodeId) -> Result<(), StateError> {
        if self.topology.contains(id) {
            Ok(())
        } else {
            Err(StateError::UnknownNode(id))
        }
    }

    async fn set_position(&mut self, id: NodeId, position: Position) -> Result<Arc<Snapshot>, StateError> {
        self.check_node(id)?;
        if !position.is_finite() {
            return Err(StateError::InvalidPosition);
        }

        info!(node = id, %position, "position updated");
        self.positions.insert(id, position);
        Ok(self.recompile().await)
    }

    async fn set_environment(&mut self, name: String) -> Result<Arc<Snapshot>, StateError> {
        let profile = *self
            .config
            .profile(&name)
            .ok_or_else(|| StateError::UnknownEnvironment(name.clone()))?;

        info!(environment = %name, "environment updated");
        self.environment = name;
        self.profile = profile;
        Ok(self.recompile().await)
    }

    async fn set_topology(&mut self, mode: TopologyMode) -> Arc<Snapshot> {
        info!(topology = %mode, "topology updated");
        self.mode = mode;
        self.recompile().await
    }

    async fn set_override(
        &mut self,
        target: NodeId,
        link_override: LinkOverride,
    ) -> Result<Arc<Snapshot>, StateError> {
        self.check_node(target)?;
        if target == self.node_id {
            return Err(StateError::SelfLink);
        }
        if !link_override.is_valid() {
            return Err(StateError::InvalidOverride);
        }

        info!(target, ?link_override, "link override set");
        self.overrides.insert(target, link_override);
        Ok(self.recompile().await)
    }

    async fn clear_override(
        &mut self,
        target: NodeId,
    ) -> Result<(Option<LinkOverride>, Arc<Snapshot>), StateError> {
        self.check_node(target)?;

        let removed = self.overrides.remove(&target);
        info!(target, removed = removed.is_some(), "link override cleared");
        Ok((removed, self.recompile().await))
    }
}

impl Snapshot {
    fn empty(node_id: NodeId) -> Self {
        Self {
            node_id,
            position: Position::ORIGIN,
            positions: BTreeMap::new(),
            environment: String::new(),
            topology: TopologyMode::default(),
            bandwidth_kbps: 0,
            peers: BTreeSet::new(),
            link_quality: BTreeMap::new(),
            link_overrides: BTreeMap::new(),
            generation: 0,
        }
    }
}

/// Cloneable handle to the state actor.
#[derive(Debug, Clone)]
pub struct StateHandle {
    mailbox: Mailbox<RadioState>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
}

impl StateHandle {
    /// Installs the initial configuration and spawns the actor owning `state`.
    ///
    /// The actor stops once every handle is dropped, returning the state.
    pub async fn spawn(mut state: RadioState) -> (Self, JoinHandle<RadioState>) {
        state.recompile().await;

        let snapshot = state.published.subscribe();
        let (mailbox, inbox) = actor::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(inbox.serve(state));

        (Self { mailbox, snapshot }, task)
    }

    /// The last committed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// A receiver notified on every commit.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.clone()
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut RadioState) -> DynFuture<'a, Result<T, StateError>> + Send + 'static,
    {
        self.mailbox.call(f).await?
    }

    /// Moves this node.
    pub async fn set_position(&self, position: Position) -> Result<Arc<Snapshot>, StateError> {
        self.mutate(move |state| {
            let id = state.node_id;
            Box::pin(state.set_position(id, position))
        })
        .await
    }

    /// Records the position of another node, as pushed by the coordinator.
    pub async fn set_peer_position(&self, id: NodeId, position: Position) -> Result<Arc<Snapshot>, StateError> {
        self.mutate(move |state| Box::pin(state.set_position(id, position))).await
    }

    /// Switches the active environment profile.
    pub async fn set_environment(&self, name: impl Into<String>) -> Result<Arc<Snapshot>, StateError> {
        let name = name.into();
        self.mutate(move |state| Box::pin(state.set_environment(name))).await
    }

    /// Switches the topology mode.
    pub async fn set_topology(&self, mode: TopologyMode) -> Result<Arc<Snapshot>, StateError> {
        self.mutate(move |state| Box::pin(async move { Ok(state.set_topology(mode).await) })).await
    }

    /// Sets or replaces the override on the link towards `target`.
    pub async fn set_override(
        &self,
        target: NodeId,
        link_override: LinkOverride,
    ) -> Result<Arc<Snapshot>, StateError> {
        self.mutate(move |state| Box::pin(state.set_override(target, link_override))).await
    }

    /// Removes the override on the link towards `target`, returning it if there was one.
    pub async fn clear_override(
        &self,
        target: NodeId,
    ) -> Result<(Option<LinkOverride>, Arc<Snapshot>), StateError> {
        self.mutate(move |state| Box::pin(state.clear_override(target))).await
    }

    /// Runs a recompilation without changing any input.
    pub async fn resync(&self) -> Result<Arc<Snapshot>, StateError> {
        self.mutate(|state| Box::pin(async move { Ok(state.recompile().await) })).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use manet_model::{EnvironmentProfile, HUB_ID};
    use manet_tc::{recording::Operation, RecordingBackend};

    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.environment.profiles.insert(
            "storm".into(),
            EnvironmentProfile { latency_multiplier: 2.0, loss_multiplier: 1.5, bandwidth_multiplier: 0.5 },
        );
        config.defaults.positions.insert(2, Position::new(500.0, 0.0, 0.0));
        config.defaults.positions.insert(3, Position::new(1200.0, 0.0, 0.0));
        config
    }

    async fn spawn(node_id: NodeId) -> (Arc<RecordingBackend>, StateHandle) {
        let backend = Arc::new(RecordingBackend::new());
        let state = RadioState::new(node_id, Topology::new(3), Arc::new(config()), backend.clone()).unwrap();
        let (handle, _task) = StateHandle::spawn(state).await;
        (backend, handle)
    }

    #[tokio::test]
    async fn initial_compile_covers_mesh_peers() {
        let (backend, handle) = spawn(1).await;
        let snapshot = handle.snapshot();

        assert_eq!(snapshot.peers, BTreeSet::from([2, 3]));
        assert_eq!(snapshot.link_quality.keys().copied().collect::<Vec<_>>(), vec![HUB_ID, 2, 3]);
        assert_eq!(snapshot.link_quality[&2].latency_ms, 30.0);
        assert!(!snapshot.link_quality[&3].reachable);
        assert_eq!(snapshot.generation, 1);
        assert_eq!(backend.installed().classes.len(), 2);
    }

    #[tokio::test]
    async fn environment_changes_bandwidth_and_links() {
        let (backend, handle) = spawn(1).await;

        let snapshot = handle.set_environment("storm").await.unwrap();
        assert_eq!(snapshot.bandwidth_kbps, 500);
        assert_eq!(snapshot.link_quality[&2].latency_ms, 60.0);
        assert_eq!(snapshot.link_quality[&2].loss_percent, 15.0);
        assert_eq!(backend.installed().bandwidth_kbps, Some(500));

        let err = handle.set_environment("fog").await.unwrap_err();
        assert!(matches!(err, StateError::UnknownEnvironment(_)));
        assert_eq!(handle.snapshot().environment, "storm");
        assert_eq!(handle.snapshot().generation, 2);
    }

    #[tokio::test]
    async fn star_topology_keeps_only_the_hub() {
        let (backend, handle) = spawn(2).await;

        let snapshot = handle.set_topology(TopologyMode::Star).await.unwrap();
        assert_eq!(snapshot.peers, BTreeSet::from([HUB_ID]));

        let installed = backend.installed();
        assert_eq!(installed.classes.len(), 1);
        assert_eq!(installed.classes[0].peer, HUB_ID);
        assert_eq!(installed.rules, vec![(11, Ipv4Addr::new(172, 31, 0, 10))]);
    }

    #[tokio::test]
    async fn overrides_are_validated_and_applied() {
        let (_backend, handle) = spawn(1).await;

        let extra = LinkOverride { extra_latency_ms: 20.0, extra_loss_percent: 5.0, partition: false };
        let snapshot = handle.set_override(2, extra).await.unwrap();
        assert_eq!(snapshot.link_quality[&2].latency_ms, 50.0);
        assert_eq!(snapshot.link_quality[&2].loss_percent, 15.0);
        assert_eq!(snapshot.link_overrides[&2], extra);

        assert!(matches!(handle.set_override(1, extra).await, Err(StateError::SelfLink)));
        assert!(matches!(handle.set_override(9, extra).await, Err(StateError::UnknownNode(9))));
        let bad = LinkOverride { extra_loss_percent: 150.0, ..extra };
        assert!(matches!(handle.set_override(2, bad).await, Err(StateError::InvalidOverride)));

        let (removed, snapshot) = handle.clear_override(2).await.unwrap();
        assert_eq!(removed, Some(extra));
        assert!(snapshot.link_overrides.is_empty());
        assert_eq!(snapshot.link_quality[&2].latency_ms, 30.0);
    }

    #[tokio::test]
    async fn partition_drops_every_packet() {
        let (backend, handle) = spawn(1).await;

        handle.set_override(2, LinkOverride::PARTITION).await.unwrap();
        let stage = backend
            .installed()
            .stages
            .into_iter()
            .find(|class| class.peer == 2)
            .unwrap();
        assert_eq!(stage.loss_percent, 100.0);
    }

    #[tokio::test]
    async fn failed_peer_is_reported_down() {
        let (backend, handle) = spawn(1).await;
        backend.fail_on(|op| matches!(op, Operation::AddClass(class) if class.peer == 2));

        let snapshot = handle.set_position(Position::new(10.0, 0.0, 0.0)).await.unwrap();
        assert!(!snapshot.link_quality[&2].reachable);
        assert_eq!(snapshot.link_quality[&2].loss_percent, 100.0);

        backend.clear_failures();
        let snapshot = handle.resync().await.unwrap();
        assert!(snapshot.link_quality[&2].reachable);
    }

    #[tokio::test]
    async fn root_failure_marks_every_peer_down() {
        let (backend, handle) = spawn(1).await;
        backend.fail_on(|op| matches!(op, Operation::SetRootCap { .. }));

        let snapshot = handle.set_topology(TopologyMode::Mesh).await.unwrap();
        assert!(snapshot.peers.iter().all(|peer| !snapshot.link_quality[peer].reachable));
        // The hub is not a mesh peer and keeps its computed quality.
        assert!(snapshot.link_quality[&HUB_ID].reachable);
    }

    #[tokio::test]
    async fn peer_positions_are_range_checked() {
        let (_backend, handle) = spawn(1).await;

        let snapshot = handle.set_peer_position(3, Position::new(100.0, 0.0, 0.0)).await.unwrap();
        assert!(snapshot.link_quality[&3].reachable);
        assert_eq!(snapshot.positions[&3], Position::new(100.0, 0.0, 0.0));

        let err = handle.set_peer_position(4, Position::ORIGIN).await.unwrap_err();
        assert!(matches!(err, StateError::UnknownNode(4)));
    }
}
