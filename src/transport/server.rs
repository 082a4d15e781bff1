//! RPC Server
//!
//! TCP accept loop for peer RPCs. Each connection gets its own task that
//! reads framed requests, dispatches them to the node's handler, and writes
//! the reply back on the same stream (FIFO per connection).

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{RpcReply, RpcRequest};
use super::{read_frame, write_frame};
use crate::error::{Error, Result};

/// Node-side dispatch for incoming RPCs
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, peer_addr: SocketAddr, request: RpcRequest) -> RpcReply;
}

/// RPC server for peer communication
pub struct RpcServer {
    bind_address: String,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(bind_address: String, handler: Arc<dyn RpcHandler>, shutdown: CancellationToken) -> Self {
        Self {
            bind_address,
            handler,
            shutdown,
        }
    }

    /// Bind and run the accept loop until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("rpc server listening on {}", self.bind_address);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, addr, handler, shutdown).await {
                                    tracing::debug!("connection from {} closed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::info!("rpc server stopped");
        Ok(())
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request: RpcRequest = tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(request) => request,
                    Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        // Peer closed the connection
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            _ = shutdown.cancelled() => return Ok(()),
        };

        tracing::trace!("received {} from {}", request.body.type_name(), peer_addr);

        let reply: RpcReply = handler.handle(peer_addr, request).await;
        write_frame(&mut writer, &reply).await?;
    }
}
