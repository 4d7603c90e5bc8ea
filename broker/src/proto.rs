use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Address, ExchangeKind};
use crate::error::BrokerError;

/// Hard cap on a single frame. Anything bigger is a protocol error, not a
/// retryable condition.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Wire frames for the TCP driver. Length-prefixed (u32 big endian) JSON.
///
/// Control frames that need an answer (`Declare`) carry a request id and are
/// answered with `DeclareOk` or `Error` for the same id. `Error` with id 0 is
/// an unsolicited server-side complaint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Declare {
        id: u64,
        address: Address,
    },
    DeclareOk {
        id: u64,
    },
    Error {
        id: u64,
        message: String,
        fatal: bool,
    },
    Publish {
        exchange: String,
        kind: ExchangeKind,
        routing_key: String,
        body: String,
    },
    Consume {
        queue: String,
        tag: u64,
    },
    Cancel {
        tag: u64,
    },
    Delete {
        queue: String,
    },
    Deliver {
        tag: u64,
        delivery: u64,
        body: String,
    },
    Ack {
        delivery: u64,
    },
    Ping,
    Pong,
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, BrokerError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(BrokerError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body)
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
    Ok(Some(frame))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
    if body.len() > MAX_FRAME {
        return Err(BrokerError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
