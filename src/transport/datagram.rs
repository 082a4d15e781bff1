//! Datagram Transport
//!
//! UDP socket wrapper for heartbeat and election gossip. Sends are
//! fire-and-forget; the receive loop decodes versioned frames and hands them
//! to the node's dispatcher. Receivers must tolerate loss, duplication, and
//! reordering.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::{Gossip, GossipFrame, PROTOCOL_VERSION};
use crate::error::{Error, Result};

/// Largest datagram we are willing to parse
const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// UDP transport for gossip messages
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
}

impl DatagramTransport {
    /// Bind the gossip socket
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind gossip socket {}: {}", addr, e)))?;
        tracing::info!("gossip transport listening on {}", addr);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Local address the socket ended up on (useful with port 0 in tests)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one gossip message; errors are returned but callers normally
    /// just log them, heartbeats are periodic anyway
    pub async fn send(&self, target: &str, msg: &Gossip) -> Result<()> {
        let frame = GossipFrame::new(msg.clone());
        let bytes = bincode::serialize(&frame)?;
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| Error::Network(format!("gossip send to {}: {}", target, e)))?;
        Ok(())
    }

    /// Spawn the receive loop. Decoded messages flow into `tx` together with
    /// the sender's socket address.
    pub fn spawn_receiver(
        &self,
        tx: mpsc::Sender<(SocketAddr, Gossip)>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];

            loop {
                let (len, src) = tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!("gossip recv error: {}", e);
                                continue;
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                };

                let frame: GossipFrame = match bincode::deserialize(&buf[..len]) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!("dropping undecodable datagram from {}: {}", src, e);
                        continue;
                    }
                };

                if frame.version != PROTOCOL_VERSION {
                    tracing::debug!(
                        "dropping datagram from {} with protocol version {}",
                        src,
                        frame.version
                    );
                    continue;
                }

                tracing::trace!("received {} from {}", frame.msg.type_name(), src);
                if tx.send((src, frame.msg)).await.is_err() {
                    break;
                }
            }

            tracing::debug!("gossip receiver stopped");
        })
    }
}
