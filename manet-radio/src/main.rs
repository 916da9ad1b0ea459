use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use manet_model::{Config, NodeId};
use manet_radio::{NodeOptions, RunningNode};
use manet_tc::{RecordingBackend, SchedulerBackend, TcBackend};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "manet_radio=info,manet_tc=info,manet_model=info";

/// Radio sidecar of a simulated mesh node.
#[derive(Parser, Debug)]
#[command(name = "manet-radio")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Id of this node (0 is the hub).
    #[arg(long, env = "DRONE_ID", default_value_t = 1)]
    node_id: NodeId,

    /// Number of participants, excluding the hub.
    #[arg(long, env = "DRONE_COUNT", default_value_t = 3)]
    node_count: NodeId,

    /// YAML configuration file. Defaults are used if it does not exist.
    #[arg(long, default_value = "/config/config.yaml")]
    config: PathBuf,

    /// Directory the metrics record is written to.
    #[arg(long, default_value = "/metrics")]
    metrics_dir: PathBuf,

    /// Address of the control-plane API.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Record shaping operations instead of running `tc`.
    #[arg(long)]
    dry_run: bool,

    /// Log filter, overridden by `RUST_LOG`.
    #[arg(long, default_value = DEFAULT_FILTER)]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if let Err(e) = run(args).await {
        error!(error = %e, "radio node failed to start");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), manet_radio::Error> {
    let config = Config::load(&args.config)?;

    let backend: Arc<dyn SchedulerBackend> = if args.dry_run {
        info!("dry run, shaping operations are only recorded");
        Arc::new(RecordingBackend::new())
    } else {
        Arc::new(TcBackend::new(config.network.interface.clone()))
    };

    let options = NodeOptions {
        node_id: args.node_id,
        node_count: args.node_count,
        listen: args.listen,
        probe_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        metrics_dir: args.metrics_dir,
    };

    let node = RunningNode::start(options, config, backend).await?;

    let cancel = node.cancellation();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutting down");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    node.wait().await;
    Ok(())
}
