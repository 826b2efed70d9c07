//! CBOR frames exchanged between relay clients and the broker.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! CBOR, all on the single bidirectional stream a client opens.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: Vec<u8> },
    /// Broker to client: a publish on a subscribed topic.
    Deliver { topic: String, payload: Vec<u8> },
    /// Broker to client: the last frame was refused.
    Error { message: String },
}

pub fn encode(frame: &RelayFrame) -> anyhow::Result<Vec<u8>> {
    let payload = serde_cbor::to_vec(frame)?;
    if payload.len() > MAX_FRAME_LEN {
        anyhow::bail!("frame of {} bytes exceeds limit", payload.len());
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub async fn write_frame<W>(writer: &mut W, frame: &RelayFrame) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(frame)?).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer finished the stream cleanly.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<RelayFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_cbor::from_slice(&payload)?))
}
