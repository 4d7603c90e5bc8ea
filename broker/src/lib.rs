pub mod address;
mod error;
pub mod memory;
pub mod proto;
pub mod server;
pub mod tcp;

use std::time::Duration;

pub use address::{Address, ExchangeKind, QueueOptions};
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use server::BrokerServer;

/// One message handed to a consumer. Acked back to the broker after the
/// consumer callback has run.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

/// The transports strand can speak, selected by the broker url scheme at
/// startup: `memory://{name}` for the in-process broker, `tcp://{addr}` for
/// the daemon.
pub enum Transport {
    Memory(memory::MemoryTransport),
    Tcp(tcp::TcpTransport),
}

impl Transport {
    pub async fn connect(
        url: &str,
        heartbeat: Duration,
    ) -> Result<Self, BrokerError> {
        if let Some(name) = url.strip_prefix("memory://") {
            return Ok(Transport::Memory(memory::MemoryTransport::connect(name)));
        }
        if let Some(addr) = url.strip_prefix("tcp://") {
            let transport = tcp::TcpTransport::connect(addr, heartbeat).await?;
            return Ok(Transport::Tcp(transport));
        }
        Err(BrokerError::BadAddress(format!(
            "unsupported broker url {}",
            url
        )))
    }

    /// Idempotently declare the exchange, queue and binding for `address`.
    pub async fn declare(&self, address: &Address) -> Result<(), BrokerError> {
        match self {
            Transport::Memory(t) => t.declare(address),
            Transport::Tcp(t) => t.declare(address).await,
        }
    }

    pub async fn publish(
        &self,
        address: &Address,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        match self {
            Transport::Memory(t) => t.publish(address, body),
            Transport::Tcp(t) => t.publish(address, body).await,
        }
    }

    /// Fetch one message from `queue`, waiting at most `timeout`. `Ok(None)`
    /// means the window elapsed without a message, which is not an error.
    pub async fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        match self {
            Transport::Memory(t) => {
                let body = t.consume(queue, timeout).await?;
                Ok(body.map(|body| Delivery {
                    queue: queue.to_string(),
                    delivery_tag: 0,
                    body,
                }))
            }
            Transport::Tcp(t) => t.consume(queue, timeout).await,
        }
    }

    /// Remove a queue and its bindings. Reply channels call this when the
    /// reply stream ends; without it each call leaks a queue for the life
    /// of the broker.
    pub async fn remove_queue(&self, queue: &str) -> Result<(), BrokerError> {
        match self {
            Transport::Memory(t) => {
                t.remove_queue(queue);
                Ok(())
            }
            Transport::Tcp(t) => t.remove_queue(queue).await,
        }
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        match self {
            // The in-process broker pops destructively; nothing to settle.
            Transport::Memory(_) => Ok(()),
            Transport::Tcp(t) => t.ack(delivery).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Transport::Memory(_) => {}
            Transport::Tcp(t) => t.close().await,
        }
    }
}
