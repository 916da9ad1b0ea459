//! Wiring of a running node: state actor, listeners, loops and the HTTP server.

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use manet_model::{config::NetworkConfig, Config, NodeId, Topology, TopologyMode};
use manet_tc::{class::MAX_PEER_CLASSES, SchedulerBackend, TrafficTracker};
use tokio::{net::TcpListener, task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::{
    api::{self, AppState},
    listener::ProbeListeners,
    metrics::MetricsSink,
    prober::Prober,
    state::{RadioState, StateHandle},
    telemetry::{unix_timestamp, NodeReport, ProbeResult, Telemetry},
    Error,
};

/// Process-level settings of a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub node_id: NodeId,
    pub node_count: NodeId,
    /// Address of the control-plane API.
    pub listen: SocketAddr,
    /// Address the probe listeners bind to.
    pub probe_ip: IpAddr,
    pub metrics_dir: PathBuf,
}

/// A started node. Dropping it does not stop the tasks; call [`RunningNode::shutdown`].
#[derive(Debug)]
pub struct RunningNode {
    state: StateHandle,
    telemetry: Arc<Telemetry>,
    api_addr: SocketAddr,
    stream_addr: SocketAddr,
    datagram_addr: SocketAddr,
    metrics: MetricsSink,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl RunningNode {
    /// Installs the initial shaping rules, binds every socket and spawns the loops.
    pub async fn start(
        options: NodeOptions,
        config: Config,
        backend: Arc<dyn SchedulerBackend>,
    ) -> Result<Self, Error> {
        if options.node_id > options.node_count {
            return Err(Error::NodeId { id: options.node_id, count: options.node_count });
        }

        let topology = Topology::new(options.node_count);
        let peers = [TopologyMode::Mesh, TopologyMode::Star]
            .into_iter()
            .map(|mode| topology.peers_for(options.node_id, mode).len())
            .max()
            .unwrap_or_default();
        if peers > MAX_PEER_CLASSES {
            return Err(Error::TooManyPeers { id: options.node_id, peers, max: MAX_PEER_CLASSES });
        }

        let config = Arc::new(config);

        let radio = RadioState::new(options.node_id, topology, Arc::clone(&config), Arc::clone(&backend))?;
        let classes = radio.class_map();
        let (state, _actor) = StateHandle::spawn(radio).await;

        let listeners = ProbeListeners::bind(
            options.probe_ip,
            config.probe.stream_port,
            config.probe.datagram_port,
            options.node_id,
        )
        .await
        .map_err(|source| Error::Bind {
            what: "probe listeners",
            addr: SocketAddr::new(options.probe_ip, config.probe.stream_port),
            source,
        })?;
        let stream_addr = listeners.stream_addr().map_err(Error::Io)?;
        let datagram_addr = listeners.datagram_addr().map_err(Error::Io)?;

        let http = TcpListener::bind(options.listen)
            .await
            .map_err(|source| Error::Bind { what: "control-plane API", addr: options.listen, source })?;
        let api_addr = http.local_addr().map_err(Error::Io)?;

        let cancel = CancellationToken::new();
        let telemetry = Arc::new(Telemetry::new());
        let metrics = MetricsSink::new(&options.metrics_dir, options.node_id);
        let mut tasks = JoinSet::new();

        tasks.spawn(listeners.run(cancel.clone()));

        let tracker = TrafficTracker::new(backend, classes);
        tasks.spawn(
            traffic_loop(state.clone(), Arc::clone(&telemetry), tracker, config.traffic.interval(), cancel.clone())
                .instrument(tracing::info_span!("traffic")),
        );

        let prober = ProbeLoop {
            state: state.clone(),
            telemetry: Arc::clone(&telemetry),
            prober: Prober::new(&config.probe),
            network: config.network.clone(),
            sink: metrics.clone(),
            interval: config.probe.interval(),
        };
        tasks.spawn(prober.run(cancel.clone()).instrument(tracing::info_span!("probe")));

        let app = api::router(AppState {
            state: state.clone(),
            telemetry: Arc::clone(&telemetry),
            config: Arc::clone(&config),
        });
        let shutdown = cancel.clone();
        tasks.spawn(async move {
            let server = axum::serve(http, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                warn!(error = %e, "control-plane server stopped");
            }
        });

        info!(
            node_id = options.node_id,
            node_count = options.node_count,
            %api_addr,
            %stream_addr,
            %datagram_addr,
            "radio node started"
        );

        Ok(Self { state, telemetry, api_addr, stream_addr, datagram_addr, metrics, cancel, tasks })
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn datagram_addr(&self) -> SocketAddr {
        self.datagram_addr
    }

    pub fn metrics_path(&self) -> &std::path::Path {
        self.metrics.path()
    }

    /// A token that stops the node when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs until the node is cancelled and every task has stopped.
    pub async fn wait(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "node task failed");
            }
        }
        info!("radio node stopped");
    }

    /// Stops every loop and listener and drains the HTTP server.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

async fn traffic_loop(
    state: StateHandle,
    telemetry: Arc<Telemetry>,
    mut tracker: TrafficTracker,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let bandwidth_kbps = state.snapshot().bandwidth_kbps;
        match tracker.sample(bandwidth_kbps).await {
            Ok(sample) => {
                debug!(load = sample.interface.load_percent, links = sample.links.len(), "traffic sampled");
                telemetry.set_traffic(sample);
            }
            Err(e) => warn!(error = %e, "failed to sample traffic counters"),
        }
    }
}

struct ProbeLoop {
    state: StateHandle,
    telemetry: Arc<Telemetry>,
    prober: Prober,
    network: NetworkConfig,
    sink: MetricsSink,
    interval: Duration,
}

impl ProbeLoop {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cycle() => {}
            }
        }
    }

    /// Probes the current peers, then publishes the results and the metrics record.
    async fn cycle(&self) {
        let snapshot = self.state.snapshot();
        let targets = snapshot.peers.iter().map(|peer| (*peer, self.network.address_of(*peer)));
        let probes = self.prober.probe_all(targets).await;

        let traffic = self.telemetry.traffic();
        let now = unix_timestamp();
        let results: BTreeMap<_, _> = probes
            .into_iter()
            .map(|(peer, probe)| {
                let result = ProbeResult::new(
                    probe,
                    snapshot.link_quality.get(&peer),
                    traffic.links.get(&peer),
                    now,
                );
                (peer, result)
            })
            .collect();

        debug!(
            peers = results.len(),
            stream_ok = results.values().filter(|r| r.tcp_ok).count(),
            "probe cycle complete"
        );
        self.telemetry.set_probes(results);

        let report = NodeReport::collect(&self.state.snapshot(), &self.telemetry);
        if let Err(e) = self.sink.write(&report).await {
            warn!(error = %e, "failed to write metrics");
        }
    }
}
