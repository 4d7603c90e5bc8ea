use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use strand_broker::{Address, Delivery, Transport};

use crate::config::RpcConfig;
use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::message::{FailureInfo, Message, RemoteErrorKind, Reply};

struct RegisteredConsumer {
    address: Address,
    dispatcher: Arc<Dispatcher>,
}

/// One broker connection. Transient transport failures are absorbed here:
/// every publish, declare and consume retries through `reconnect`, which
/// re-establishes the transport and re-declares every registered consumer
/// before the caller sees control again. Fatal errors (declare conflicts,
/// bad addresses) are not retried.
pub struct Connection {
    conf: RpcConfig,
    transport: Transport,
    consumers: Vec<RegisteredConsumer>,
}

fn backoff(conf: &RpcConfig, attempt: u32) -> Duration {
    let ms = conf
        .reconnect_interval_min
        .saturating_mul(1u64 << attempt.min(32))
        .min(conf.reconnect_interval_max);
    Duration::from_millis(ms)
}

impl Connection {
    pub async fn open(conf: RpcConfig) -> Result<Self, RpcError> {
        let heartbeat = Duration::from_secs(conf.heartbeat);
        let mut attempt = 0u32;
        let transport = loop {
            match Transport::connect(&conf.broker_url, heartbeat).await {
                Ok(t) => break t,
                Err(e) if e.is_transient() => {
                    if let Some(max) = conf.max_retries {
                        if attempt >= max {
                            return Err(RpcError::Failed(format!(
                                "giving up after {} attempts: {}",
                                attempt + 1,
                                e
                            )));
                        }
                    }
                    let wait = backoff(&conf, attempt);
                    warn!(error = %e, ?wait, "broker connect failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(Self {
            conf,
            transport,
            consumers: Vec::new(),
        })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.conf
    }

    /// Tear down the current transport, connect a fresh one with bounded
    /// exponential backoff, and re-declare every registered consumer queue.
    async fn reconnect(&mut self) -> Result<(), RpcError> {
        self.transport.close().await;
        let heartbeat = Duration::from_secs(self.conf.heartbeat);
        let mut attempt = 0u32;
        loop {
            if let Some(max) = self.conf.max_retries {
                if attempt >= max {
                    return Err(RpcError::Failed(format!(
                        "giving up after {} reconnect attempts",
                        attempt
                    )));
                }
            }
            let wait = backoff(&self.conf, attempt);
            tokio::time::sleep(wait).await;
            attempt += 1;

            match Transport::connect(&self.conf.broker_url, heartbeat).await {
                Ok(t) => self.transport = t,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt, "reconnect failed");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            match self.redeclare_consumers().await {
                Ok(()) => {
                    debug!(attempt, "reconnected");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt, "redeclare after reconnect failed");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn redeclare_consumers(
        &self,
    ) -> Result<(), strand_broker::BrokerError> {
        for consumer in &self.consumers {
            self.transport.declare(&consumer.address).await?;
        }
        Ok(())
    }

    /// Declare an address, reconnecting through transient failures.
    pub async fn declare_queue(
        &mut self,
        address: &Address,
    ) -> Result<(), RpcError> {
        loop {
            match self.transport.declare(address).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, queue = %address.queue, "declare failed");
                    self.reconnect().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Publish a payload, reconnecting through transient failures.
    pub async fn publish(
        &mut self,
        address: &Address,
        body: &[u8],
    ) -> Result<(), RpcError> {
        loop {
            match self.transport.publish(address, body).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, exchange = %address.exchange, "publish failed");
                    self.reconnect().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn consume_raw(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, RpcError> {
        loop {
            match self.transport.consume(queue, timeout).await {
                Ok(d) => return Ok(d),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, queue, "consume failed");
                    self.reconnect().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove a queue this connection declared. Single attempt; callers
    /// tearing down reply channels treat failure as a defunct transport.
    pub async fn remove_queue(&mut self, queue: &str) -> Result<(), RpcError> {
        self.transport.remove_queue(queue).await.map_err(Into::into)
    }

    /// Attach a dispatcher to a topic. With `fanout` set the consumer gets
    /// a private queue bound to the fanout exchange and its own copy of
    /// every message; otherwise it competes on the shared topic queue.
    pub async fn create_consumer(
        &mut self,
        topic: &str,
        dispatcher: Arc<Dispatcher>,
        fanout: bool,
    ) -> Result<(), RpcError> {
        let address = if fanout {
            Address::fanout_subscription(topic)
        } else {
            Address::topic(&self.conf.control_exchange, topic)
        };
        self.declare_queue(&address).await?;
        self.consumers.push(RegisteredConsumer {
            address,
            dispatcher,
        });
        Ok(())
    }

    /// Poll each registered consumer queue once, dispatching whatever
    /// arrives. The configured consume window is sliced evenly across the
    /// consumers so one idle queue cannot starve the others.
    pub async fn consume_once(&mut self) -> Result<(), RpcError> {
        if self.consumers.is_empty() {
            tokio::time::sleep(Duration::from_millis(
                self.conf.consume_timeout_ms,
            ))
            .await;
            return Ok(());
        }
        let slice = Duration::from_millis(
            (self.conf.consume_timeout_ms / self.consumers.len() as u64).max(1),
        );
        for i in 0..self.consumers.len() {
            let queue = self.consumers[i].address.queue.clone();
            let dispatcher = self.consumers[i].dispatcher.clone();
            if let Some(delivery) = self.consume_raw(&queue, slice).await? {
                self.handle_delivery(&dispatcher, &delivery).await?;
                self.transport.ack(&delivery).await.ok();
            }
        }
        Ok(())
    }

    /// Decode a delivery, dispatch it, and publish replies if the sender
    /// asked for them. Dispatch failures are relayed to the caller as
    /// failure replies and never tear down the consume loop; undecodable
    /// payloads are logged and dropped.
    async fn handle_delivery(
        &mut self,
        dispatcher: &Dispatcher,
        delivery: &Delivery,
    ) -> Result<(), RpcError> {
        let msg = match Message::decode(&delivery.body) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, queue = %delivery.queue, "dropping undecodable message");
                return Ok(());
            }
        };
        let ctx = msg.context.clone().unwrap_or_default();
        let msg_id = msg.msg_id.clone();
        let reply_q = msg.reply_q.clone().or_else(|| msg_id.clone());

        let outcome = dispatcher.dispatch(&ctx, &msg.request).await;

        let (msg_id, reply_q) = match (msg_id, reply_q) {
            (Some(id), Some(q)) => (id, q),
            _ => {
                // Cast path: no reply channel, failures are log-only.
                if let Err(e) = outcome {
                    warn!(error = %e, method = %msg.request.method, "cast dispatch failed");
                }
                return Ok(());
            }
        };

        let reply_addr = Address::direct(&reply_q);
        match outcome {
            Ok(values) => {
                for value in values {
                    let reply = Reply::result(&msg_id, value);
                    self.publish(&reply_addr, &reply.encode()?).await?;
                }
                let reply = Reply::ending(&msg_id);
                self.publish(&reply_addr, &reply.encode()?).await?;
            }
            Err(e) => {
                warn!(error = %e, method = %msg.request.method, "dispatch failed");
                let reply = Reply::failure(&msg_id, failure_info(e));
                self.publish(&reply_addr, &reply.encode()?).await?;
            }
        }
        Ok(())
    }

    /// Move the connection into a background consume loop. The returned
    /// handle stops the loop and gives the connection back on `cancel`.
    pub fn consume_in_thread(mut self) -> ConsumerThread {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    res = self.consume_once() => {
                        if let Err(e) = res {
                            warn!(error = %e, "consumer loop stopping");
                            break;
                        }
                    }
                }
            }
            self
        });
        ConsumerThread {
            stop: Some(stop_tx),
            handle,
        }
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

/// Turn a dispatch error into the wire failure form. `Remote` already
/// carries one; everything else gets the matching kind.
fn failure_info(e: RpcError) -> FailureInfo {
    match e {
        RpcError::Remote(info) => info,
        RpcError::NoSuchMethod(m) => FailureInfo {
            kind: RemoteErrorKind::NoSuchMethod,
            message: format!("no such method {}", m),
            detail: Value::Null,
        },
        RpcError::UnsupportedVersion(v) => FailureInfo {
            kind: RemoteErrorKind::UnsupportedVersion,
            message: format!("unsupported version {}", v),
            detail: Value::Null,
        },
        other => FailureInfo {
            kind: RemoteErrorKind::Unknown,
            message: other.to_string(),
            detail: Value::Null,
        },
    }
}

/// Handle on a background consumer task.
pub struct ConsumerThread {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Connection>,
}

impl ConsumerThread {
    /// Stop the loop and recover the connection. A loop that already exited
    /// on its own yields `Failed`.
    pub async fn cancel(mut self) -> Result<Connection, RpcError> {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        self.handle
            .await
            .map_err(|e| RpcError::Failed(format!("consumer task panicked: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let conf = RpcConfig {
            reconnect_interval_min: 100,
            reconnect_interval_max: 1000,
            ..Default::default()
        };
        assert_eq!(backoff(&conf, 0), Duration::from_millis(100));
        assert_eq!(backoff(&conf, 1), Duration::from_millis(200));
        assert_eq!(backoff(&conf, 2), Duration::from_millis(400));
        assert_eq!(backoff(&conf, 5), Duration::from_millis(1000));
        assert_eq!(backoff(&conf, 40), Duration::from_millis(1000));
    }
}
