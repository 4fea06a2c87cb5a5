use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::orders::Side;

/// One execution attempt request. Redelivery of a message for a terminal or
/// unknown order is acknowledged silently by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMessage {
    pub order_id: String,
    pub side: Side,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Set on retry messages: the worker must not attempt a fill earlier.
    pub not_before: Option<DateTime<Utc>>,
}

pub struct BusReceivers {
    pub active: Vec<mpsc::UnboundedReceiver<OrderMessage>>,
    pub retry: mpsc::UnboundedReceiver<OrderMessage>,
}

/// The `orders.active` / `orders.retry` queues. Active delivery is spread
/// over a fixed partition set keyed by `order_id` hash, so all messages for
/// one order land on the same consumer in enqueue order. There is no
/// ordering guarantee across orders. Delivery failures are logged, never
/// surfaced to callers.
pub struct ExecutionBus {
    active: Vec<mpsc::UnboundedSender<OrderMessage>>,
    retry: mpsc::UnboundedSender<OrderMessage>,
}

impl ExecutionBus {
    pub fn new(active_partitions: usize) -> (Self, BusReceivers) {
        let partitions = active_partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        (
            Self { active: senders, retry: retry_tx },
            BusReceivers { active: receivers, retry: retry_rx },
        )
    }

    pub fn partition_count(&self) -> usize {
        self.active.len()
    }

    pub fn partition_for(&self, order_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        order_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.active.len()
    }

    pub fn publish_active(&self, msg: OrderMessage) {
        let idx = self.partition_for(&msg.order_id);
        if self.active[idx].send(msg.clone()).is_err() {
            warn!(order_id = %msg.order_id, partition = idx, "active queue consumer gone, dropping message");
        }
    }

    pub fn publish_retry(&self, msg: OrderMessage) {
        if self.retry.send(msg.clone()).is_err() {
            warn!(order_id = %msg.order_id, "retry queue consumer gone, dropping message");
        }
    }
}
