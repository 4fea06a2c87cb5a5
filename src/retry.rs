use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::OrderMessage;
use crate::cache::RetryRecord;
use crate::orders::OrderStatus;
use crate::state::Trading;

impl Trading {
    /// Schedule the next attempt after a miss: bump the count, persist the
    /// retry record, and publish to `orders.retry` with the eligibility
    /// instant. Past the maximum this is a defensive no-op; the worker
    /// already force-fills the attempt after the last scheduled retry.
    pub async fn schedule_retry(&self, msg: &OrderMessage) {
        let retry_count = msg.retry_count + 1;
        if retry_count > self.cfg.max_retry_count {
            warn!(
                order_id = %msg.order_id,
                retry_count,
                "retry budget exhausted, not rescheduling"
            );
            return;
        }
        let now = self.clock.now_utc();
        let next_eligible_at = now + chrono::Duration::seconds(self.cfg.retry_delay_secs);
        self.cache.put_retry_record(RetryRecord {
            order_id: msg.order_id.clone(),
            retry_count,
            next_eligible_at,
        });
        self.bus.publish_retry(OrderMessage {
            order_id: msg.order_id.clone(),
            side: msg.side,
            retry_count,
            enqueued_at: now,
            not_before: Some(next_eligible_at),
        });
        info!(
            order_id = %msg.order_id,
            retry_count,
            next_eligible_at = %next_eligible_at,
            "retry scheduled"
        );
    }

    /// Instant before which the worker must not attempt this order again.
    /// The persisted record wins over the message copy; with neither, the
    /// message is immediately eligible.
    pub fn retry_eligible_at(&self, msg: &OrderMessage) -> Option<chrono::DateTime<Utc>> {
        self.cache
            .get_retry_record(&msg.order_id)
            .map(|r| r.next_eligible_at)
            .or(msg.not_before)
    }
}

/// Consumer for `orders.retry`. Messages carry an absolute eligibility
/// instant; sleeping here is the delayed-delivery primitive. Retry delays
/// are uniform, so queue order and eligibility order agree and one sleeper
/// never starves a later message.
pub async fn run_retry_worker(trading: Arc<Trading>, mut rx: mpsc::UnboundedReceiver<OrderMessage>) {
    info!("retry worker started");
    let poll = std::time::Duration::from_secs(crate::worker::POLL_TIMEOUT_SECS);
    loop {
        match tokio::time::timeout(poll, rx.recv()).await {
            Ok(Some(msg)) => deliver_when_eligible(&trading, msg).await,
            Ok(None) => break,
            Err(_elapsed) => continue,
        }
    }
    info!("retry worker stopped");
}

pub async fn deliver_when_eligible(trading: &Trading, msg: OrderMessage) {
    if let Some(at) = trading.retry_eligible_at(&msg) {
        let now = trading.clock.now_utc();
        if at > now {
            let wait = (at - now).to_std().unwrap_or_default();
            debug!(order_id = %msg.order_id, wait_ms = wait.as_millis() as u64, "delaying retry");
            tokio::time::sleep(wait).await;
        }
    }

    // A cheap terminal check saves a pointless round trip through the
    // active queue; the worker re-checks on consumption either way.
    match trading.orders.get(&msg.order_id).await {
        Some(order) if order.status == OrderStatus::Pending => {}
        _ => {
            debug!(order_id = %msg.order_id, "retry dropped, order no longer pending");
            return;
        }
    }

    trading.bus.publish_active(OrderMessage {
        order_id: msg.order_id,
        side: msg.side,
        retry_count: msg.retry_count,
        enqueued_at: trading.clock.now_utc(),
        not_before: None,
    });
}
