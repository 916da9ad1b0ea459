//! Stream and datagram responders that answer the probes of other nodes.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prober::MAX_REPLY;

/// How long a stream client gets to send its handshake before we reply anyway.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept or receive. Errors like EMFILE persist until something is freed.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The reply sent by node `id` on both listeners.
pub fn reply_for(id: manet_model::NodeId) -> String {
    format!("DRONE{id}_OK\n")
}

/// Bound probe listeners, ready to run.
#[derive(Debug)]
pub struct ProbeListeners {
    stream: TcpListener,
    datagram: UdpSocket,
    reply: Arc<str>,
}

impl ProbeListeners {
    /// Binds both listeners. Failing to bind is fatal at startup.
    pub async fn bind(
        ip: IpAddr,
        stream_port: u16,
        datagram_port: u16,
        id: manet_model::NodeId,
    ) -> io::Result<Self> {
        let stream = TcpListener::bind((ip, stream_port)).await?;
        let datagram = UdpSocket::bind((ip, datagram_port)).await?;

        Ok(Self { stream, datagram, reply: reply_for(id).into() })
    }

    pub fn stream_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn datagram_addr(&self) -> io::Result<SocketAddr> {
        self.datagram.local_addr()
    }

    /// Serves both listeners until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if let (Ok(stream), Ok(datagram)) = (self.stream_addr(), self.datagram_addr()) {
            info!(%stream, %datagram, "probe listeners running");
        }

        tokio::join!(
            serve_stream(self.stream, Arc::clone(&self.reply), cancel.clone()),
            serve_datagram(self.datagram, self.reply, cancel),
        );
    }
}

async fn serve_stream(listener: TcpListener, reply: Arc<str>, cancel: CancellationToken) {
    loop {
        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "stream accept failed");
                    if back_off(&cancel).await {
                        continue;
                    }
                    break;
                }
            },
        };

        let reply = Arc::clone(&reply);
        tokio::spawn(async move {
            if let Err(e) = answer(conn, &reply).await {
                debug!(%peer, error = %e, "stream probe aborted");
            }
        });
    }
}

async fn answer(mut conn: TcpStream, reply: &str) -> io::Result<()> {
    let mut buf = [0u8; MAX_REPLY];
    // The content of the handshake does not matter.
    let _ = tokio::time::timeout(READ_TIMEOUT, conn.read(&mut buf)).await;

    conn.write_all(reply.as_bytes()).await?;
    conn.shutdown().await
}

async fn serve_datagram(socket: UdpSocket, reply: Arc<str>, cancel: CancellationToken) {
    let mut buf = [0u8; MAX_REPLY];
    loop {
        let peer = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((_, peer)) => peer,
                Err(e) => {
                    debug!(error = %e, "datagram receive failed");
                    if back_off(&cancel).await {
                        continue;
                    }
                    break;
                }
            },
        };

        if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
            debug!(%peer, error = %e, "datagram reply failed");
        }
    }
}

/// Waits [`ERROR_BACKOFF`]. Returns `false` if the listener was cancelled in the meantime.
async fn back_off(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ERROR_BACKOFF) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn failed_accepts_wait_before_retrying() {
        let cancel = CancellationToken::new();

        let started = Instant::now();
        assert!(back_off(&cancel).await);
        assert!(started.elapsed() >= ERROR_BACKOFF);

        cancel.cancel();
        let started = Instant::now();
        assert!(!back_off(&cancel).await);
        assert!(started.elapsed() < ERROR_BACKOFF);
    }

    #[test]
    fn reply_names_the_node() {
        assert_eq!(reply_for(3), "DRONE3_OK\n");
    }
}
