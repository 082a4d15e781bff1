//! Transport Module
//!
//! Framed request-reply RPC over TCP plus best-effort UDP datagrams for
//! heartbeats and election messages.

pub mod protocol;

mod client;
mod datagram;
mod server;

pub use client::RpcClient;
pub use datagram::DatagramTransport;
pub use server::{RpcHandler, RpcServer};

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use protocol::FrameHeader;

/// Maximum allowed frame size (64 MB); rejects malformed length prefixes
/// before they can exhaust memory
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Read one length-prefixed, checksummed frame from a reader
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    let frame_len = header.length as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "frame too large: {} bytes (max {})",
            frame_len, MAX_FRAME_SIZE
        )));
    }
    if frame_len > 1024 * 1024 {
        tracing::debug!("receiving large frame: {} KB", frame_len / 1024);
    }

    let mut body = vec![0u8; frame_len];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("frame checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write one length-prefixed, checksummed frame to a writer
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(value)?;
    let header = FrameHeader::new(&body);

    let mut frame = BytesMut::with_capacity(FrameHeader::SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::protocol::{RpcBody, RpcRequest};

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let req = RpcRequest::new(RpcBody::DigestRequest, 1000);

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let restored: RpcRequest = read_frame(&mut cursor).await.unwrap();
        assert_eq!(restored.id, req.id);
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let req = RpcRequest::new(RpcBody::DigestRequest, 1000);

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();
        // Flip a byte in the body, past the header
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<RpcRequest> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        let header = FrameHeader {
            length: (MAX_FRAME_SIZE + 1) as u32,
            checksum: 0,
        };
        buf.extend_from_slice(&header.to_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<RpcRequest> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
