use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::BrokerError;
use crate::proto::{self, Frame};
use crate::Delivery;

const DECLARE_TIMEOUT: Duration = Duration::from_secs(10);

struct Subscription {
    tag: u64,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, Vec<u8>)>>>,
}

struct TcpInner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    // In-flight declare requests, keyed by request id.
    requests: Mutex<HashMap<u64, oneshot::Sender<Result<(), BrokerError>>>>,
    // Consumer tag -> channel the reader task routes deliveries into.
    routes: Mutex<HashMap<u64, mpsc::UnboundedSender<(u64, Vec<u8>)>>>,
    subscriptions: tokio::sync::Mutex<HashMap<String, Subscription>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl TcpInner {
    async fn send(&self, frame: &Frame) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = proto::write_frame(&mut *writer, frame).await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn fail_pending(&self) {
        let senders: Vec<_> = {
            let mut requests = self.requests.lock().unwrap();
            requests.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.send(Err(BrokerError::Closed));
        }
        self.routes.lock().unwrap().clear();
    }
}

/// TCP driver talking `proto::Frame`s to a strand broker daemon. A reader
/// task fans deliveries out to per-consumer channels; an optional heartbeat
/// task pings the daemon and marks the transport closed when pongs stop.
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    pub async fn connect(
        addr: &str,
        heartbeat: Duration,
    ) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(TcpInner {
            writer: tokio::sync::Mutex::new(write_half),
            requests: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            last_pong: Mutex::new(Instant::now()),
        });

        tokio::spawn(read_loop(read_half, Arc::downgrade(&inner)));
        if !heartbeat.is_zero() {
            tokio::spawn(heartbeat_loop(Arc::downgrade(&inner), heartbeat));
        }
        Ok(Self { inner })
    }

    pub async fn declare(&self, address: &Address) -> Result<(), BrokerError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().unwrap().insert(id, tx);

        let frame = Frame::Declare {
            id,
            address: address.clone(),
        };
        if let Err(e) = self.inner.send(&frame).await {
            self.inner.requests.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(DECLARE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                self.inner.requests.lock().unwrap().remove(&id);
                Err(BrokerError::Io("declare timed out".to_string()))
            }
        }
    }

    pub async fn publish(
        &self,
        address: &Address,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let body = String::from_utf8(body.to_vec())
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        self.inner
            .send(&Frame::Publish {
                exchange: address.exchange.clone(),
                kind: address.kind,
                routing_key: address.routing_key.clone(),
                body,
            })
            .await
    }

    pub async fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let rx = self.subscription(queue).await?;
        let mut rx = rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some((delivery_tag, body))) => Ok(Some(Delivery {
                queue: queue.to_string(),
                delivery_tag,
                body,
            })),
            // The reader task dropped the sender: transport is gone.
            Ok(None) => Err(BrokerError::Closed),
        }
    }

    /// Tear down a queue: cancel its subscription, drop the local routing
    /// state, and ask the daemon to delete it.
    pub async fn remove_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let sub = self.inner.subscriptions.lock().await.remove(queue);
        if let Some(sub) = sub {
            self.inner.routes.lock().unwrap().remove(&sub.tag);
            self.inner.send(&Frame::Cancel { tag: sub.tag }).await?;
        }
        self.inner
            .send(&Frame::Delete {
                queue: queue.to_string(),
            })
            .await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner
            .send(&Frame::Ack {
                delivery: delivery.delivery_tag,
            })
            .await
    }

    pub async fn close(&self) {
        let tags: Vec<u64> = {
            let subscriptions = self.inner.subscriptions.lock().await;
            subscriptions.values().map(|sub| sub.tag).collect()
        };
        for tag in tags {
            let _ = self.inner.send(&Frame::Cancel { tag }).await;
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.fail_pending();
        let mut writer = self.inner.writer.lock().await;
        use tokio::io::AsyncWriteExt;
        let _ = writer.shutdown().await;
    }

    async fn subscription(
        &self,
        queue: &str,
    ) -> Result<
        Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, Vec<u8>)>>>,
        BrokerError,
    > {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if let Some(sub) = subscriptions.get(queue) {
            return Ok(sub.rx.clone());
        }
        let tag = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.lock().unwrap().insert(tag, tx);
        if let Err(e) = self
            .inner
            .send(&Frame::Consume {
                queue: queue.to_string(),
                tag,
            })
            .await
        {
            self.inner.routes.lock().unwrap().remove(&tag);
            return Err(e);
        }
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        subscriptions.insert(
            queue.to_string(),
            Subscription {
                tag,
                rx: rx.clone(),
            },
        );
        Ok(rx)
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inner: Weak<TcpInner>) {
    loop {
        let frame = match proto::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("broker closed the connection");
                break;
            }
            Err(e) => {
                warn!("broker read error: {}", e);
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Frame::Deliver {
                tag,
                delivery,
                body,
            } => {
                let tx = inner.routes.lock().unwrap().get(&tag).cloned();
                match tx {
                    Some(tx) => {
                        let _ = tx.send((delivery, body.into_bytes()));
                    }
                    None => {
                        debug!("delivery for unknown consumer tag {}", tag);
                    }
                }
            }
            Frame::DeclareOk { id } => {
                if let Some(tx) = inner.requests.lock().unwrap().remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            Frame::Error { id, message, fatal } => {
                if id == 0 {
                    warn!("broker error: {}", message);
                    continue;
                }
                if let Some(tx) = inner.requests.lock().unwrap().remove(&id) {
                    let err = if fatal {
                        BrokerError::Declare(message)
                    } else {
                        BrokerError::Io(message)
                    };
                    let _ = tx.send(Err(err));
                }
            }
            Frame::Ping => {
                let _ = inner.send(&Frame::Pong).await;
            }
            Frame::Pong => {
                *inner.last_pong.lock().unwrap() = Instant::now();
            }
            other => {
                debug!("unexpected frame from broker: {:?}", other);
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.closed.store(true, Ordering::SeqCst);
        inner.fail_pending();
    }
}

async fn heartbeat_loop(inner: Weak<TcpInner>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let silent_for = inner.last_pong.lock().unwrap().elapsed();
        if silent_for > interval * 3 {
            warn!("no heartbeat from broker for {:?}, closing", silent_for);
            inner.closed.store(true, Ordering::SeqCst);
            inner.fail_pending();
            return;
        }
        if inner.send(&Frame::Ping).await.is_err() {
            return;
        }
    }
}
