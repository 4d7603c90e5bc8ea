use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::memory::BrokerCore;
use crate::proto::{self, Frame};

const CONSUME_POLL: Duration = Duration::from_millis(500);

/// Standalone broker daemon. Routes through the same exchange/queue core as
/// the in-process driver; each client connection gets a session task that
/// speaks `proto::Frame`s.
pub struct BrokerServer {
    core: Arc<BrokerCore>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BrokerServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            core: Arc::new(BrokerCore::new()),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self) -> Result<()> {
        info!("broker listening on {}", self.local_addr);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let core = self.core.clone();
            tokio::spawn(async move {
                debug!("session from {}", peer);
                if let Err(e) = run_session(core, stream).await {
                    warn!("session {} ended: {}", peer, e);
                }
            });
        }
    }
}

struct Session {
    core: Arc<BrokerCore>,
    out_tx: mpsc::UnboundedSender<Frame>,
    // Stop flags for the per-consumer delivery pumps, keyed by tag.
    consumers: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    // Exclusive queues this session declared; torn down when it ends.
    owned_queues: Mutex<Vec<String>>,
    next_delivery: AtomicU64,
    unacked: AtomicU64,
}

async fn run_session(core: Arc<BrokerCore>, stream: TcpStream) -> Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, out_rx));

    let session = Arc::new(Session {
        core,
        out_tx,
        consumers: Mutex::new(HashMap::new()),
        owned_queues: Mutex::new(Vec::new()),
        next_delivery: AtomicU64::new(1),
        unacked: AtomicU64::new(0),
    });

    let result = loop {
        match proto::read_frame(&mut read_half).await {
            Ok(Some(frame)) => session.handle(frame),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    session.shutdown();
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = proto::write_frame(&mut writer, &frame).await {
            debug!("session write failed: {}", e);
            return;
        }
    }
}

impl Session {
    fn handle(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Declare { id, address } => {
                let reply = match self.core.declare(&address) {
                    Ok(()) => {
                        if address.options.auto_delete && !address.queue.is_empty()
                        {
                            self.owned_queues
                                .lock()
                                .unwrap()
                                .push(address.queue.clone());
                        }
                        Frame::DeclareOk { id }
                    }
                    Err(e) => Frame::Error {
                        id,
                        message: e.to_string(),
                        fatal: !e.is_transient(),
                    },
                };
                let _ = self.out_tx.send(reply);
            }
            Frame::Publish {
                exchange,
                kind,
                routing_key,
                body,
            } => {
                if let Err(e) = self.core.publish(
                    &exchange,
                    kind,
                    &routing_key,
                    body.as_bytes(),
                ) {
                    let _ = self.out_tx.send(Frame::Error {
                        id: 0,
                        message: e.to_string(),
                        fatal: !e.is_transient(),
                    });
                }
            }
            Frame::Consume { queue, tag } => {
                let Some(queue_handle) = self.core.queue(&queue) else {
                    let _ = self.out_tx.send(Frame::Error {
                        id: 0,
                        message: format!("consume from undeclared queue {}", queue),
                        fatal: true,
                    });
                    return;
                };
                let stop = Arc::new(AtomicBool::new(false));
                self.consumers.lock().unwrap().insert(tag, stop.clone());
                let session = self.clone();
                tokio::spawn(async move {
                    loop {
                        if stop.load(Ordering::SeqCst)
                            || session.out_tx.is_closed()
                        {
                            return;
                        }
                        let Some(body) = queue_handle.pop(CONSUME_POLL).await
                        else {
                            continue;
                        };
                        let delivery = session
                            .next_delivery
                            .fetch_add(1, Ordering::SeqCst);
                        session.unacked.fetch_add(1, Ordering::SeqCst);
                        let frame = Frame::Deliver {
                            tag,
                            delivery,
                            body: String::from_utf8_lossy(&body).into_owned(),
                        };
                        if session.out_tx.send(frame).is_err() {
                            return;
                        }
                    }
                });
            }
            Frame::Cancel { tag } => {
                if let Some(stop) = self.consumers.lock().unwrap().remove(&tag) {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            Frame::Delete { queue } => {
                self.core.remove_queue(&queue);
                self.owned_queues.lock().unwrap().retain(|q| q != &queue);
            }
            Frame::Ack { delivery: _ } => {
                // Delivery is at-most-once; the ack only settles bookkeeping.
                let before = self.unacked.load(Ordering::SeqCst);
                if before > 0 {
                    self.unacked.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Frame::Ping => {
                let _ = self.out_tx.send(Frame::Pong);
            }
            Frame::Pong => {}
            other => {
                debug!("unexpected frame from client: {:?}", other);
            }
        }
    }

    fn shutdown(&self) {
        for (_, stop) in self.consumers.lock().unwrap().drain() {
            stop.store(true, Ordering::SeqCst);
        }
        for queue in self.owned_queues.lock().unwrap().drain(..) {
            self.core.remove_queue(&queue);
        }
        let unacked = self.unacked.load(Ordering::SeqCst);
        if unacked > 0 {
            debug!("session ended with {} unacked deliveries", unacked);
        }
    }
}
