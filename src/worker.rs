use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::OrderMessage;
use crate::config::TradingConfig;
use crate::error::TradeError;
use crate::orders::{Order, OrderStatus, Side};
use crate::state::Trading;

/// Result of one execution attempt. The worker dispatches on the tag;
/// `Failed` carries the settlement error it acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Filled,
    ForcedFilled,
    Missed,
    Failed(String),
}

/// The probabilistic core, pure over the drawn uniforms: the per-attempt
/// rate is jittered inside [floor, ceiling) and the attempt fills when the
/// decision draw lands under it.
pub fn fill_decision(draw: f64, jitter: f64, floor: f64, ceiling: f64) -> bool {
    let rate = floor + jitter * (ceiling - floor);
    draw < rate
}

/// Decide one attempt. Attempts past the retry budget fill with certainty.
pub fn decide_attempt<R: Rng>(retry_count: u32, cfg: &TradingConfig, rng: &mut R) -> AttemptOutcome {
    if retry_count >= cfg.max_retry_count {
        return AttemptOutcome::ForcedFilled;
    }
    let jitter: f64 = rng.gen();
    let draw: f64 = rng.gen();
    if fill_decision(draw, jitter, cfg.fill_rate_floor, cfg.fill_rate_ceiling) {
        AttemptOutcome::Filled
    } else {
        AttemptOutcome::Missed
    }
}

/// Consumer poll timeout; an idle worker wakes up this often.
pub const POLL_TIMEOUT_SECS: u64 = 30;

/// Consumer loop for one `orders.active` partition.
pub async fn run_active_worker(
    trading: Arc<Trading>,
    mut rx: mpsc::UnboundedReceiver<OrderMessage>,
    partition: usize,
) {
    info!(partition, "matching worker started");
    let mut rng = StdRng::from_entropy();
    let poll = std::time::Duration::from_secs(POLL_TIMEOUT_SECS);
    loop {
        let msg = match tokio::time::timeout(poll, rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_elapsed) => continue,
        };
        match process_message(&trading, &msg, &mut rng).await {
            Some(outcome) => {
                debug!(order_id = %msg.order_id, retry_count = msg.retry_count, ?outcome, "attempt finished")
            }
            None => debug!(order_id = %msg.order_id, "message acknowledged without attempt"),
        }
    }
    info!(partition, "matching worker stopped");
}

/// Process one message. `None` means the message was acknowledged without
/// an attempt: unknown order, already-terminal order, or a lost claim race.
/// Redelivery after a crash-before-ack lands here and is a no-op.
pub async fn process_message<R: Rng>(
    trading: &Trading,
    msg: &OrderMessage,
    rng: &mut R,
) -> Option<AttemptOutcome> {
    let Some(order) = trading.orders.get(&msg.order_id).await else {
        warn!(order_id = %msg.order_id, "message for unknown order, acknowledging");
        return None;
    };
    if order.status != OrderStatus::Pending {
        debug!(
            order_id = %msg.order_id,
            status = order.status.as_str(),
            "order already settled, acknowledging"
        );
        return None;
    }

    let outcome = decide_attempt(msg.retry_count, &trading.cfg, rng);
    if outcome == AttemptOutcome::Missed {
        trading.schedule_retry(msg).await;
        return Some(AttemptOutcome::Missed);
    }

    // Claim the order before touching the ledger; losing the race to a
    // concurrent finalizer means acknowledging without side effects.
    if trading
        .orders
        .transition(&order.order_id, OrderStatus::Pending, OrderStatus::Executed)
        .await
        .is_err()
    {
        debug!(order_id = %order.order_id, "lost settlement claim, acknowledging");
        return None;
    }

    match settle_fill(trading, &order).await {
        Ok(()) => {
            trading.cache.clear_retry_record(&order.order_id);
            info!(
                order_id = %order.order_id,
                side = order.side.as_str(),
                qty = order.quantity,
                price = order.price,
                forced = outcome == AttemptOutcome::ForcedFilled,
                "order executed"
            );
            Some(outcome)
        }
        Err(e) => {
            if order.side == Side::Buy {
                // Cash was reserved at admission; hand it back.
                if let Err(refund_err) = trading
                    .ledger
                    .release_cash(&order.account_id, order.notional(), &order.order_id)
                    .await
                {
                    error!(order_id = %order.order_id, error = %refund_err, "buy reservation refund failed");
                }
            }
            if let Err(demote_err) = trading.orders.fail_execution(&order.order_id).await {
                error!(order_id = %order.order_id, error = %demote_err, "could not mark order failed");
            }
            trading.cache.clear_retry_record(&order.order_id);
            error!(order_id = %order.order_id, error = %e, "fill settlement failed");
            Some(AttemptOutcome::Failed(e.to_string()))
        }
    }
}

async fn settle_fill(trading: &Trading, order: &Order) -> Result<(), TradeError> {
    match order.side {
        Side::Buy => {
            trading
                .ledger
                .apply_buy_fill(&order.account_id, &order.ticker, order.quantity, order.price)
                .await?;
            Ok(())
        }
        Side::Sell => {
            let hold_id = order.holding_id.as_deref().ok_or_else(|| {
                TradeError::Internal(format!("sell order {} has no holding", order.order_id))
            })?;
            trading.ledger.apply_sell_fill(hold_id, order.quantity).await?;
            trading
                .ledger
                .credit_cash(&order.account_id, order.notional(), &order.order_id)
                .await?;
            Ok(())
        }
    }
}
