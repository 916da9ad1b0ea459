use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use manet_model::config::{NetworkConfig, ProbeConfig};
use manet_radio::{NodeOptions, RunningNode};
use manet_tc::{recording::Operation, RecordingBackend};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::test_config;

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn node_shapes_probes_and_reports() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = test_config();
    config.network = NetworkConfig {
        subnet_base: Ipv4Addr::new(127, 0, 0, 0),
        host_offset: 1,
        interface: "lo".into(),
    };
    config.probe = ProbeConfig { interval_secs: 1, timeout_ms: 500, stream_port: 0, datagram_port: 0 };
    config.traffic.interval_secs = 1;

    let metrics_dir = std::env::temp_dir().join(format!("manet-node-{}", std::process::id()));
    let backend = Arc::new(RecordingBackend::new());
    let options = NodeOptions {
        node_id: 1,
        node_count: 3,
        listen: "127.0.0.1:0".parse().unwrap(),
        probe_ip: Ipv4Addr::LOCALHOST.into(),
        metrics_dir: metrics_dir.clone(),
    };

    let node = RunningNode::start(options, config, backend.clone()).await.unwrap();
    assert_eq!(node.state().snapshot().peers.len(), 2);
    assert_eq!(backend.installed().classes.len(), 2);

    // The first probe cycle runs right away; give it time to finish and write the record.
    let path = node.metrics_path().to_path_buf();
    let mut record = None;
    for _ in 0..100 {
        if let Ok(bytes) = tokio::fs::read(&path).await {
            record = Some(serde_json::from_slice::<serde_json::Value>(&bytes).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let record = record.expect("metrics record written");
    assert_eq!(record["node_id"], 1);
    assert!(record["probes"]["2"].is_object());
    assert!(record["probes"]["3"].is_object());
    assert!(record["timestamp"].as_f64().unwrap() > 0.0);

    let response = http_get(node.api_addr(), "/status").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"ok\":true"));

    // Counters were read by the traffic loop.
    assert!(backend.counter_reads() > 0);
    assert!(!backend.operations().contains(&Operation::ReadCounters));

    tokio::time::timeout(Duration::from_secs(5), node.shutdown()).await.unwrap();
    let _ = tokio::fs::remove_dir_all(&metrics_dir).await;
}

#[tokio::test]
async fn topologies_beyond_class_capacity_are_rejected() {
    let options = |node_id| NodeOptions {
        node_id,
        node_count: 89,
        listen: "127.0.0.1:0".parse().unwrap(),
        probe_ip: Ipv4Addr::LOCALHOST.into(),
        metrics_dir: std::env::temp_dir(),
    };

    // The hub shapes every participant in either mode.
    let err = RunningNode::start(options(0), test_config(), Arc::new(RecordingBackend::new())).await.unwrap_err();
    assert!(matches!(err, manet_radio::Error::TooManyPeers { id: 0, peers: 89, max: 88 }));

    let mut options = options(1);
    options.node_count = 120;
    let err = RunningNode::start(options, test_config(), Arc::new(RecordingBackend::new())).await.unwrap_err();
    assert!(matches!(err, manet_radio::Error::TooManyPeers { id: 1, peers: 119, max: 88 }));
}

#[tokio::test]
async fn node_id_outside_topology_is_rejected() {
    let options = NodeOptions {
        node_id: 5,
        node_count: 3,
        listen: "127.0.0.1:0".parse().unwrap(),
        probe_ip: Ipv4Addr::LOCALHOST.into(),
        metrics_dir: std::env::temp_dir(),
    };

    let err = RunningNode::start(options, test_config(), Arc::new(RecordingBackend::new())).await.unwrap_err();
    assert!(matches!(err, manet_radio::Error::NodeId { id: 5, count: 3 }));
}
