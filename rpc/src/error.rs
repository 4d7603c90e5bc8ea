use std::fmt;

use strand_broker::BrokerError;

use crate::message::FailureInfo;

/// Caller-visible RPC failures.
///
/// Transient transport trouble never shows up here directly; the connection
/// retries it internally. What the caller can see is a deadline expiry
/// (`Timeout`), a dispatch refusal (`UnsupportedVersion` / `NoSuchMethod`),
/// a failure relayed from the remote handler (`Remote`), exhausted
/// reconnect attempts (`Failed`), or a fatal broker configuration error
/// (`Broker`).
#[derive(Debug)]
pub enum RpcError {
    /// No reply arrived within the call deadline.
    Timeout,
    /// No registered handler matches the requested major/minor version.
    UnsupportedVersion(String),
    /// A version-compatible handler exists but lacks the method.
    NoSuchMethod(String),
    /// The remote handler reported a failure.
    Remote(FailureInfo),
    /// Fatal broker-level error (declare conflict, bad address).
    Broker(BrokerError),
    /// The reconnect loop ran out of configured retries.
    Failed(String),
    /// A second handler claimed an already-registered (namespace, major).
    DuplicateHandler(String),
    Encode(String),
    Decode(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "rpc timeout"),
            RpcError::UnsupportedVersion(v) => {
                write!(f, "unsupported rpc version {}", v)
            }
            RpcError::NoSuchMethod(m) => write!(f, "no such rpc method {}", m),
            RpcError::Remote(info) => {
                write!(f, "remote error ({:?}): {}", info.kind, info.message)
            }
            RpcError::Broker(e) => write!(f, "{}", e),
            RpcError::Failed(s) => write!(f, "connection failed: {}", s),
            RpcError::DuplicateHandler(s) => {
                write!(f, "duplicate handler for {}", s)
            }
            RpcError::Encode(s) => write!(f, "encode error: {}", s),
            RpcError::Decode(s) => write!(f, "decode error: {}", s),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<BrokerError> for RpcError {
    fn from(e: BrokerError) -> Self {
        RpcError::Broker(e)
    }
}
