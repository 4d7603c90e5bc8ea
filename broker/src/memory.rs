use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use tokio::sync::Notify;
use tracing::debug;

use crate::address::{Address, ExchangeKind, QueueOptions};
use crate::error::BrokerError;

lazy_static! {
    static ref BROKERS: Mutex<HashMap<String, MemoryBroker>> =
        Mutex::new(HashMap::new());
}

/// A single broker queue. Pushes never block; pops wait on a `Notify` until
/// a message or the timeout arrives. Multiple consumers popping the same
/// queue compete, which is exactly the load-shared topic behavior.
pub struct Queue {
    options: QueueOptions,
    messages: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, body: Vec<u8>) {
        self.messages.lock().unwrap().push_back(body);
        self.notify.notify_one();
    }

    pub async fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(body) = self.messages.lock().unwrap().pop_front() {
                return Some(body);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    return None;
                }
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

struct Exchange {
    kind: ExchangeKind,
    // (queue name, routing key)
    bindings: Vec<(String, String)>,
}

/// Exchange/queue routing state shared by the in-process driver and the TCP
/// broker daemon.
pub struct BrokerCore {
    exchanges: Mutex<HashMap<String, Exchange>>,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerCore {
    pub fn new() -> Self {
        Self {
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Declare the exchange, queue and binding named by `address`.
    /// Redeclaring with identical options is a no-op; redeclaring with
    /// different kind or options is a configuration error and is never
    /// retried.
    pub fn declare(&self, address: &Address) -> Result<(), BrokerError> {
        {
            let mut exchanges = self.exchanges.lock().unwrap();
            match exchanges.get(&address.exchange) {
                Some(exchange) => {
                    if exchange.kind != address.kind {
                        return Err(BrokerError::Declare(format!(
                            "exchange {} already declared as {:?}",
                            address.exchange, exchange.kind
                        )));
                    }
                }
                None => {
                    exchanges.insert(
                        address.exchange.clone(),
                        Exchange {
                            kind: address.kind,
                            bindings: Vec::new(),
                        },
                    );
                }
            }
        }

        if address.queue.is_empty() {
            // Publisher-side declaration, exchange only.
            return Ok(());
        }

        {
            let mut queues = self.queues.lock().unwrap();
            match queues.get(&address.queue) {
                Some(queue) => {
                    if queue.options != address.options {
                        return Err(BrokerError::Declare(format!(
                            "queue {} already declared with {:?}",
                            address.queue, queue.options
                        )));
                    }
                }
                None => {
                    queues.insert(
                        address.queue.clone(),
                        Arc::new(Queue::new(address.options)),
                    );
                }
            }
        }

        let mut exchanges = self.exchanges.lock().unwrap();
        let exchange = exchanges.get_mut(&address.exchange).unwrap();
        let binding = (address.queue.clone(), address.routing_key.clone());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    /// Route a message. Publishing to an unknown exchange or to an exchange
    /// with no matching binding drops the message: fire-and-forget sends to
    /// topics nobody consumes are not an error.
    pub fn publish(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let targets: Vec<String> = {
            let exchanges = self.exchanges.lock().unwrap();
            let Some(ex) = exchanges.get(exchange) else {
                debug!("dropping message for unknown exchange {}", exchange);
                return Ok(());
            };
            if ex.kind != kind {
                return Err(BrokerError::Declare(format!(
                    "exchange {} is {:?}, published as {:?}",
                    exchange, ex.kind, kind
                )));
            }
            match ex.kind {
                ExchangeKind::Fanout => {
                    ex.bindings.iter().map(|(q, _)| q.clone()).collect()
                }
                ExchangeKind::Direct | ExchangeKind::Topic => ex
                    .bindings
                    .iter()
                    .filter(|(_, key)| key == routing_key)
                    .map(|(q, _)| q.clone())
                    .collect(),
            }
        };

        let queues = self.queues.lock().unwrap();
        for name in targets {
            if let Some(queue) = queues.get(&name) {
                queue.push(body.to_vec());
            }
        }
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().unwrap().get(name).cloned()
    }

    /// Remove a queue and its bindings. Direct exchanges left with no
    /// bindings go too; reply channels declare one exchange per call and
    /// would otherwise accumulate forever.
    pub fn remove_queue(&self, name: &str) {
        self.queues.lock().unwrap().remove(name);
        let mut exchanges = self.exchanges.lock().unwrap();
        for exchange in exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        exchanges.retain(|_, ex| {
            ex.kind != ExchangeKind::Direct || !ex.bindings.is_empty()
        });
    }
}

/// Handle on a named in-process broker. Cloning shares the broker; all
/// transports connected to the same `memory://{name}` url see the same
/// exchanges and queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

struct MemoryBrokerInner {
    core: BrokerCore,
    // Failure injection for exercising the reconnect path in tests.
    fail_next: AtomicU32,
    declare_attempts: AtomicU32,
}

impl MemoryBroker {
    fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBrokerInner {
                core: BrokerCore::new(),
                fail_next: AtomicU32::new(0),
                declare_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Look up (or create) the broker registered under `name`.
    pub fn get(name: &str) -> Self {
        BROKERS
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(MemoryBroker::new)
            .clone()
    }

    pub fn core(&self) -> &BrokerCore {
        &self.inner.core
    }

    /// Make the next `n` declare/publish/consume operations fail with a
    /// transient I/O error.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn declare_attempts(&self) -> u32 {
        self.inner.declare_attempts.load(Ordering::SeqCst)
    }

    fn check_injected_failure(&self) -> Result<(), BrokerError> {
        let remaining = self.inner.fail_next.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .inner
                .fail_next
                .compare_exchange(
                    remaining,
                    remaining - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            return Err(BrokerError::Io("injected failure".to_string()));
        }
        Ok(())
    }
}

/// In-process transport driver.
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn connect(name: &str) -> Self {
        Self {
            broker: MemoryBroker::get(name),
        }
    }

    pub fn declare(&self, address: &Address) -> Result<(), BrokerError> {
        self.broker
            .inner
            .declare_attempts
            .fetch_add(1, Ordering::SeqCst);
        self.broker.check_injected_failure()?;
        self.broker.core().declare(address)
    }

    pub fn publish(
        &self,
        address: &Address,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.broker.check_injected_failure()?;
        self.broker.core().publish(
            &address.exchange,
            address.kind,
            &address.routing_key,
            body,
        )
    }

    pub fn remove_queue(&self, queue: &str) {
        self.broker.core().remove_queue(queue);
    }

    pub async fn consume(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BrokerError> {
        self.broker.check_injected_failure()?;
        let Some(queue) = self.broker.core().queue(queue) else {
            return Err(BrokerError::BadAddress(format!(
                "consume from undeclared queue {}",
                queue
            )));
        };
        Ok(queue.pop(timeout).await)
    }
}
