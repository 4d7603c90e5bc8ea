use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use strand_broker::Address;

use crate::context::Context;
use crate::error::RpcError;
use crate::message::{Message, Reply, Request};
use crate::pool::{Pool, PooledConnection};

/// Client entry points for a topic. All traffic goes through the shared
/// pool; nothing here holds a connection between operations except an open
/// multicall stream.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, RpcError> {
        msg.encode(self.pool.config().envelope)
    }

    /// Fire-and-forget invocation on `topic`. One competing consumer gets
    /// it. Broker trouble is logged, not raised; casts carry no delivery
    /// promise.
    pub async fn cast(
        &self,
        ctx: &Context,
        topic: &str,
        request: Request,
    ) -> Result<(), RpcError> {
        let msg = Message::new(request, ctx.clone());
        let body = self.encode(&msg)?;
        let address =
            Address::topic(&self.pool.config().control_exchange, topic);
        self.send_oneway(&address, &body, topic).await;
        Ok(())
    }

    /// Fire-and-forget to every consumer of `topic` at once.
    pub async fn fanout_cast(
        &self,
        ctx: &Context,
        topic: &str,
        request: Request,
    ) -> Result<(), RpcError> {
        let msg = Message::new(request, ctx.clone());
        let body = self.encode(&msg)?;
        let address = Address::fanout(topic);
        self.send_oneway(&address, &body, topic).await;
        Ok(())
    }

    /// Publish a notification on the durable notification queue for
    /// `topic`. Like casts, delivery failures are logged and swallowed.
    pub async fn notify(
        &self,
        ctx: &Context,
        topic: &str,
        request: Request,
    ) -> Result<(), RpcError> {
        let msg = Message::new(request, ctx.clone());
        let body = self.encode(&msg)?;
        let address =
            Address::notify(&self.pool.config().control_exchange, topic);
        self.send_oneway(&address, &body, topic).await;
        Ok(())
    }

    async fn send_oneway(&self, address: &Address, body: &[u8], topic: &str) {
        let result = async {
            let mut conn = self.pool.get().await?;
            conn.declare_queue(address).await?;
            conn.publish(address, body).await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, topic, "oneway send failed");
        }
    }

    /// Invoke a method and wait for its single result. Handlers that send
    /// several results before ending only have the last one surfaced here;
    /// use [`Client::multicall`] to see them all.
    pub async fn call(
        &self,
        ctx: &Context,
        topic: &str,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let mut stream = self.multicall(ctx, topic, request, timeout).await?;
        let mut last = Value::Null;
        while let Some(value) = stream.next().await {
            last = value?;
        }
        Ok(last)
    }

    /// Invoke a method and stream its results back one at a time.
    ///
    /// A fresh reply queue named by the message id is declared before the
    /// request is published, so replies cannot race the subscription. The
    /// timeout is per fetch: each `next` gets the full window again, so a
    /// slow producer of many results does not trip the deadline as long as
    /// the gaps between results stay under it.
    pub async fn multicall(
        &self,
        ctx: &Context,
        topic: &str,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<MulticallStream, RpcError> {
        let msg_id = strand_utils::uuid();
        let mut msg = Message::new(request, ctx.clone());
        msg.msg_id = Some(msg_id.clone());
        msg.reply_q = Some(msg_id.clone());
        let body = self.encode(&msg)?;

        let reply_addr = Address::direct(&msg_id);
        let topic_addr =
            Address::topic(&self.pool.config().control_exchange, topic);

        let mut conn = self.pool.get().await?;
        conn.declare_queue(&reply_addr).await?;
        conn.declare_queue(&topic_addr).await?;
        conn.publish(&topic_addr, &body).await?;

        let timeout = timeout.unwrap_or(Duration::from_millis(
            self.pool.config().response_timeout_ms,
        ));
        Ok(MulticallStream {
            conn: Some(conn),
            msg_id,
            timeout,
            done: false,
        })
    }
}

/// In-flight multicall. Holds a pooled connection until the reply stream
/// ends, times out or errors; the reply queue is torn down and the
/// connection goes back to the pool on any of those, except that a
/// transport failure mid-stream keeps the connection out of it.
pub struct MulticallStream {
    conn: Option<PooledConnection>,
    msg_id: String,
    timeout: Duration,
    done: bool,
}

impl MulticallStream {
    /// Fetch the next result. `None` once the remote side has sent its
    /// ending marker. The timeout clock restarts on every fetch.
    pub async fn next(&mut self) -> Option<Result<Value, RpcError>> {
        if self.done {
            return None;
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let conn = match self.conn.as_mut() {
                Some(conn) => conn,
                None => return None,
            };
            let now = Instant::now();
            if now >= deadline {
                self.finish().await;
                return Some(Err(RpcError::Timeout));
            }
            let delivery =
                match conn.consume_raw(&self.msg_id, deadline - now).await {
                    Ok(Some(d)) => d,
                    Ok(None) => {
                        self.finish().await;
                        return Some(Err(RpcError::Timeout));
                    }
                    Err(e) => {
                        self.fail();
                        return Some(Err(e));
                    }
                };
            let reply = match Reply::decode(&delivery.body) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, queue = %self.msg_id, "dropping undecodable reply");
                    continue;
                }
            };
            if reply.msg_id.as_deref() != Some(self.msg_id.as_str()) {
                warn!(
                    msg_id = ?reply.msg_id,
                    expected = %self.msg_id,
                    "dropping reply with foreign correlation id"
                );
                continue;
            }
            if let Some(failure) = reply.failure {
                self.finish().await;
                return Some(Err(RpcError::Remote(failure)));
            }
            if reply.ending {
                self.finish().await;
                return None;
            }
            return Some(Ok(reply.result));
        }
    }

    /// End the stream: delete the per-call reply queue and hand the
    /// connection back to the pool. A teardown failure means the transport
    /// is in an unknown state, so the connection is retired instead.
    async fn finish(&mut self) {
        self.done = true;
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.remove_queue(&self.msg_id).await {
                warn!(error = %e, queue = %self.msg_id, "reply queue teardown failed");
                conn.set_defunct();
            }
        }
    }

    fn fail(&mut self) {
        self.done = true;
        if let Some(mut conn) = self.conn.take() {
            conn.set_defunct();
        }
    }
}
