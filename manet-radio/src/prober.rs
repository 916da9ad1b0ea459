//! Active connectivity checks against peers.
//!
//! Each check is bounded by the probe timeout and never fails: an unreachable peer is a normal
//! result, not an error. The three checks towards a peer, and all peers, run concurrently.

use std::{collections::BTreeMap, io, net::Ipv4Addr, time::Duration};

use futures::future::join_all;
use manet_model::{config::ProbeConfig, NodeId};
use manet_tc::command::Runner;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, trace};

/// Echo result of an unreachable peer.
pub const UNREACHABLE_MS: f64 = -1.0;

/// Token sent on the stream check.
pub const STREAM_HANDSHAKE: &[u8] = b"PING\n";

/// Token sent on the datagram check.
pub const DATAGRAM_HANDSHAKE: &[u8] = b"PING";

/// Replies longer than this are truncated.
pub const MAX_REPLY: usize = 64;

/// Outcome of the three checks towards one peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    /// Echo round-trip in milliseconds, [`UNREACHABLE_MS`] on failure.
    pub ping_ms: f64,
    pub tcp_ok: bool,
    pub udp_ok: bool,
}

/// Extracts the round-trip time from `ping` output (`... time=0.045 ms`).
pub fn parse_echo_time(output: &str) -> Option<f64> {
    output.split("time=").nth(1)?.split_whitespace().next()?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct Prober {
    timeout: Duration,
    stream_port: u16,
    datagram_port: u16,
    runner: Runner,
}

impl Prober {
    pub fn new(config: &ProbeConfig) -> Self {
        let timeout = config.timeout();
        Self {
            timeout,
            stream_port: config.stream_port,
            datagram_port: config.datagram_port,
            // `ping -W` only bounds the wait for a reply, not process startup.
            runner: Runner::new(timeout + Duration::from_secs(1)),
        }
    }

    /// Probes every target concurrently.
    pub async fn probe_all(
        &self,
        targets: impl IntoIterator<Item = (NodeId, Ipv4Addr)>,
    ) -> BTreeMap<NodeId, Probe> {
        let probes = targets.into_iter().map(|(peer, addr)| async move { (peer, self.probe(addr).await) });
        join_all(probes).await.into_iter().collect()
    }

    /// Runs the echo, stream and datagram checks against `addr`.
    pub async fn probe(&self, addr: Ipv4Addr) -> Probe {
        let (ping_ms, tcp_ok, udp_ok) = tokio::join!(self.echo(addr), self.stream(addr), self.datagram(addr));
        trace!(%addr, ping_ms, tcp_ok, udp_ok, "probed");
        Probe { ping_ms, tcp_ok, udp_ok }
    }

    /// A single ICMP echo through the host `ping`.
    pub async fn echo(&self, addr: Ipv4Addr) -> f64 {
        let wait = self.timeout.as_secs().max(1).to_string();
        let target = addr.to_string();

        match self.runner.run("ping", ["-c", "1", "-W", wait.as_str(), target.as_str()]).await {
            Ok(output) => parse_echo_time(&output.stdout).unwrap_or(UNREACHABLE_MS),
            Err(e) => {
                debug!(%addr, error = %e, "echo failed");
                UNREACHABLE_MS
            }
        }
    }

    /// Connects, sends the handshake and expects any non-empty reply.
    pub async fn stream(&self, addr: Ipv4Addr) -> bool {
        let check = async {
            let mut stream = TcpStream::connect((addr, self.stream_port)).await?;
            stream.write_all(STREAM_HANDSHAKE).await?;

            let mut buf = [0u8; MAX_REPLY];
            let n = stream.read(&mut buf).await?;
            Ok::<_, io::Error>(n > 0)
        };

        self.bounded(addr, "stream", check).await
    }

    /// Sends one datagram and expects any non-empty reply.
    pub async fn datagram(&self, addr: Ipv4Addr) -> bool {
        let check = async {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.connect((addr, self.datagram_port)).await?;
            socket.send(DATAGRAM_HANDSHAKE).await?;

            let mut buf = [0u8; MAX_REPLY];
            let n = socket.recv(&mut buf).await?;
            Ok::<_, io::Error>(n > 0)
        };

        self.bounded(addr, "datagram", check).await
    }

    async fn bounded(
        &self,
        addr: Ipv4Addr,
        check: &'static str,
        fut: impl std::future::Future<Output = io::Result<bool>>,
    ) -> bool {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                debug!(%addr, check, error = %e, "check failed");
                false
            }
            Err(_) => {
                debug!(%addr, check, timeout = ?self.timeout, "check timed out");
                false
            }
        }
    }
}
