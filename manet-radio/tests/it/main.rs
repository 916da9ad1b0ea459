mod api;
mod node;
mod probe;

use std::sync::Arc;

use manet_model::{Config, EnvironmentProfile, NodeId, Position, Topology};
use manet_radio::{state::RadioState, StateHandle};
use manet_tc::RecordingBackend;

/// Default configuration plus a "storm" profile, node 2 at 500m and node 3 out of range.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.environment.profiles.insert(
        "storm".into(),
        EnvironmentProfile { latency_multiplier: 2.0, loss_multiplier: 1.5, bandwidth_multiplier: 0.5 },
    );
    config.defaults.positions.insert(2, Position::new(500.0, 0.0, 0.0));
    config.defaults.positions.insert(3, Position::new(1200.0, 0.0, 0.0));
    config
}

/// Spawns the state actor of `node_id` in a 3-node topology, over a recording backend.
pub(crate) async fn spawn_state(
    node_id: NodeId,
    config: Arc<Config>,
) -> (Arc<RecordingBackend>, StateHandle) {
    let backend = Arc::new(RecordingBackend::new());
    let state = RadioState::new(node_id, Topology::new(3), config, backend.clone()).unwrap();
    let (handle, _actor) = StateHandle::spawn(state).await;
    (backend, handle)
}
