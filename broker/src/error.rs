use std::fmt;

/// Transport-level failures, split into transient errors (the connection
/// layer retries these through its reconnect loop) and fatal errors
/// (configuration mistakes that must surface immediately).
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// I/O failure talking to the broker. Transient.
    Io(String),
    /// The transport was closed underneath us. Transient.
    Closed,
    /// Conflicting redeclaration of an exchange or queue. Fatal.
    Declare(String),
    /// Malformed broker url or address. Fatal.
    BadAddress(String),
    /// The peer sent something the wire protocol can't represent. Fatal.
    Protocol(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Io(_) | BrokerError::Closed)
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Io(s) => write!(f, "broker io error: {}", s),
            BrokerError::Closed => write!(f, "broker connection closed"),
            BrokerError::Declare(s) => write!(f, "declare conflict: {}", s),
            BrokerError::BadAddress(s) => write!(f, "bad address: {}", s),
            BrokerError::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e.to_string())
    }
}
