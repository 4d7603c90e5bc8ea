use serde::{Deserialize, Serialize};

/// Exchange routing behavior.
///
/// Direct exchanges route on an exact key and back reply channels and
/// point-to-point calls. Topic exchanges hang one shared queue per topic off
/// the control exchange, so competing consumers load-share. Fanout exchanges
/// copy every message into every bound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// A resolved broker address: which exchange a message goes through, which
/// queue a consumer reads from, and the declaration options for both.
///
/// Publishers may carry an address with an empty queue name (fanout
/// publishing binds no queue of its own); declaring such an address only
/// declares the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    pub options: QueueOptions,
}

impl Address {
    /// Point-to-point address: the `"{topic}/{topic}"` form. Exclusive,
    /// auto-deleted queue; used for reply channels keyed by message id.
    pub fn direct(topic: &str) -> Self {
        Self {
            exchange: topic.to_string(),
            kind: ExchangeKind::Direct,
            queue: topic.to_string(),
            routing_key: topic.to_string(),
            options: QueueOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
            },
        }
    }

    /// Load-shared topic address under the control exchange. The queue name
    /// equals the topic, so every consumer of the topic competes on the same
    /// queue and each message is delivered to exactly one of them.
    pub fn topic(control_exchange: &str, topic: &str) -> Self {
        Self {
            exchange: control_exchange.to_string(),
            kind: ExchangeKind::Topic,
            queue: topic.to_string(),
            routing_key: topic.to_string(),
            options: QueueOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
        }
    }

    /// Notification address. Notification traffic rides the same durable
    /// load-shared queues as topic traffic.
    pub fn notify(control_exchange: &str, topic: &str) -> Self {
        Self::topic(control_exchange, topic)
    }

    /// Publisher-side fanout address: the `"{topic}_fanout"` exchange with
    /// no queue of its own.
    pub fn fanout(topic: &str) -> Self {
        Self {
            exchange: format!("{}_fanout", topic),
            kind: ExchangeKind::Fanout,
            queue: String::new(),
            routing_key: topic.to_string(),
            options: QueueOptions::default(),
        }
    }

    /// Consumer-side fanout address. The queue name carries a random suffix
    /// so each subscriber owns a private queue and receives its own copy
    /// instead of competing for one.
    pub fn fanout_subscription(topic: &str) -> Self {
        Self {
            exchange: format!("{}_fanout", topic),
            kind: ExchangeKind::Fanout,
            queue: format!("{}_fanout_{}", topic, strand_utils::rand_string(8)),
            routing_key: topic.to_string(),
            options: QueueOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_address_form() {
        let addr = Address::direct("msg-id-1");
        assert_eq!(addr.exchange, "msg-id-1");
        assert_eq!(addr.queue, "msg-id-1");
        assert_eq!(addr.kind, ExchangeKind::Direct);
        assert!(addr.options.exclusive);
    }

    #[test]
    fn topic_address_uses_control_exchange() {
        let addr = Address::topic("strand", "compute");
        assert_eq!(addr.exchange, "strand");
        assert_eq!(addr.queue, "compute");
        assert!(addr.options.durable);
        assert!(!addr.options.exclusive);
    }

    #[test]
    fn fanout_subscriptions_are_unique_per_consumer() {
        let a = Address::fanout_subscription("compute");
        let b = Address::fanout_subscription("compute");
        assert_eq!(a.exchange, "compute_fanout");
        assert!(a.queue.starts_with("compute_fanout_"));
        assert_ne!(a.queue, b.queue);
    }
}
