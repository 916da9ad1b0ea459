use std::{net::Ipv4Addr, time::Duration};

use manet_model::config::ProbeConfig;
use manet_radio::{
    listener::{reply_for, ProbeListeners},
    prober::{Prober, STREAM_HANDSHAKE},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tokio_util::sync::CancellationToken;

async fn listeners(id: u32) -> (ProbeConfig, CancellationToken, tokio::task::JoinHandle<()>) {
    let _ = tracing_subscriber::fmt::try_init();

    let listeners = ProbeListeners::bind(Ipv4Addr::LOCALHOST.into(), 0, 0, id).await.unwrap();
    let config = ProbeConfig {
        interval_secs: 1,
        timeout_ms: 500,
        stream_port: listeners.stream_addr().unwrap().port(),
        datagram_port: listeners.datagram_addr().unwrap().port(),
    };

    let cancel = CancellationToken::new();
    let task = tokio::spawn(listeners.run(cancel.clone()));
    (config, cancel, task)
}

#[tokio::test]
async fn listeners_reply_with_node_id() {
    let (config, cancel, task) = listeners(7).await;

    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, config.stream_port)).await.unwrap();
    stream.write_all(STREAM_HANDSHAKE).await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, reply_for(7));
    assert_eq!(reply, "DRONE7_OK\n");

    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    socket.send_to(b"PING", (Ipv4Addr::LOCALHOST, config.datagram_port)).await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"DRONE7_OK\n");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn stream_and_datagram_checks_succeed_against_listeners() {
    let (config, cancel, _task) = listeners(2).await;
    let prober = Prober::new(&config);

    assert!(prober.stream(Ipv4Addr::LOCALHOST).await);
    assert!(prober.datagram(Ipv4Addr::LOCALHOST).await);

    cancel.cancel();
}

#[tokio::test]
async fn checks_fail_without_listeners() {
    // Grab two free ports, then release them.
    let stream_port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap().local_addr().unwrap().port();
    let datagram_port = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap().local_addr().unwrap().port();

    let prober = Prober::new(&ProbeConfig { interval_secs: 1, timeout_ms: 300, stream_port, datagram_port });

    let started = std::time::Instant::now();
    assert!(!prober.stream(Ipv4Addr::LOCALHOST).await);
    assert!(!prober.datagram(Ipv4Addr::LOCALHOST).await);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn probe_all_reports_every_target() {
    let (config, cancel, _task) = listeners(1).await;
    let prober = Prober::new(&config);

    let probes = prober.probe_all([(2, Ipv4Addr::LOCALHOST), (3, Ipv4Addr::LOCALHOST)]).await;
    assert_eq!(probes.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
    assert!(probes.values().all(|probe| probe.tcp_ok && probe.udp_ok));

    cancel.cancel();
}
