//! RPC Client
//!
//! Pooled TCP client for peer RPCs. Every call carries an explicit deadline;
//! transient failures are retried with jittered exponential backoff while
//! deadline budget remains. One pooled connection per peer; a saturated
//! connection fails fast with `PeerBusy`.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::protocol::{RpcBody, RpcReply, RpcRequest};
use super::{read_frame, write_frame};
use crate::error::{Error, Result};

/// How long to wait for the per-peer connection lock before failing fast
const BUSY_WAIT: Duration = Duration::from_millis(250);

/// Initial retry backoff; doubles per attempt with jitter
const BACKOFF_BASE: Duration = Duration::from_millis(50);

struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Pooled RPC client
pub struct RpcClient {
    pool: RwLock<HashMap<String, Arc<Mutex<Option<PoolEntry>>>>>,
    connect_timeout: Duration,
}

impl RpcClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Issue one RPC with retries inside the deadline. Returns the reply or
    /// a distinguished `Timeout` once the budget is spent.
    pub async fn call(&self, address: &str, body: RpcBody, deadline: Duration) -> Result<RpcReply> {
        let started = Instant::now();
        let mut backoff = BACKOFF_BASE;
        let mut last_err: Option<Error> = None;

        loop {
            let remaining = match deadline.checked_sub(started.elapsed()) {
                Some(d) if d > Duration::ZERO => d,
                _ => {
                    return Err(last_err.unwrap_or_else(|| Error::Timeout(address.to_string())));
                }
            };

            let request = RpcRequest::new(body.clone(), remaining.as_millis() as u64);
            match timeout(remaining, self.call_once(address, &request)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::debug!("rpc to {} failed ({}), retrying", address, e);
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::Timeout(address.to_string())),
            }

            let jitter = rand::thread_rng().gen_range(0..backoff.as_millis().max(1) as u64);
            let pause = backoff + Duration::from_millis(jitter);
            if started.elapsed() + pause >= deadline {
                return Err(last_err.unwrap_or_else(|| Error::Timeout(address.to_string())));
            }
            tokio::time::sleep(pause).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    async fn call_once(&self, address: &str, request: &RpcRequest) -> Result<RpcReply> {
        let slot = self.slot(address).await;

        let mut guard = match timeout(BUSY_WAIT, slot.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(Error::PeerBusy(address.to_string())),
        };

        // Reuse the pooled connection when it is still alive
        if let Some(entry) = guard.as_mut() {
            let (mut reader, mut writer) = entry.stream.split();
            if write_frame(&mut writer, request).await.is_ok() {
                match read_frame::<_, RpcReply>(&mut reader).await {
                    Ok(reply) if reply.id == request.id => {
                        entry.last_used = Instant::now();
                        return Ok(reply);
                    }
                    Ok(_) => {
                        // Reply for a different request means the stream is
                        // desynchronized; drop it and redial
                        tracing::warn!("rpc stream to {} desynchronized, reconnecting", address);
                    }
                    Err(_) => {}
                }
            }
            *guard = None;
        }

        let mut stream = self.connect(address).await?;
        let reply: RpcReply = {
            let (mut reader, mut writer) = stream.split();
            write_frame(&mut writer, request).await?;
            read_frame(&mut reader).await?
        };
        if reply.id != request.id {
            return Err(Error::Network(format!(
                "rpc reply id mismatch from {}",
                address
            )));
        }
        *guard = Some(PoolEntry {
            stream,
            last_used: Instant::now(),
        });
        Ok(reply)
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout(address.to_string())),
        }
    }

    async fn slot(&self, address: &str) -> Arc<Mutex<Option<PoolEntry>>> {
        {
            let pool = self.pool.read().await;
            if let Some(slot) = pool.get(address) {
                return Arc::clone(slot);
            }
        }
        let mut pool = self.pool.write().await;
        Arc::clone(
            pool.entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    /// Drop pooled connections idle longer than `max_idle`
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let pool = self.pool.read().await;
        let now = Instant::now();
        for (addr, slot) in pool.iter() {
            if let Ok(mut guard) = slot.try_lock() {
                let stale = guard
                    .as_ref()
                    .map(|e| now.duration_since(e.last_used) > max_idle)
                    .unwrap_or(false);
                if stale {
                    tracing::debug!("dropping stale connection to {}", addr);
                    *guard = None;
                }
            }
        }
    }

    /// Close every pooled connection
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let client = RpcClient::new(Duration::from_millis(200));

        let result = client
            .call(
                "127.0.0.1:1",
                RpcBody::DigestRequest,
                Duration::from_millis(400),
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "TRANSIENT_PEER");
    }

    #[tokio::test]
    async fn test_deadline_is_honored() {
        let client = RpcClient::new(Duration::from_secs(5));

        // Unroutable address: connect hangs until the call deadline trips
        let started = Instant::now();
        let result = client
            .call(
                "10.255.255.1:5001",
                RpcBody::DigestRequest,
                Duration::from_millis(300),
            )
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
