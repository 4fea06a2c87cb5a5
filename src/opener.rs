use tracing::{error, info, warn};

use crate::error::TradeError;
use crate::orders::{Order, OrderStatus, Side};
use crate::state::Trading;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenerSummary {
    pub promoted: usize,
    pub cancelled: usize,
    pub errors: usize,
}

impl Trading {
    /// Promote every RESERVED order at market open. Buy orders re-anchor to
    /// the live price and the cash reservation is adjusted by the delta;
    /// when the extra delta cannot be reserved the order is cancelled and
    /// the original reservation refunded in full. Sell orders just take the
    /// live price. Each order is its own transaction; a failure is logged
    /// and the sweep moves on.
    pub async fn open_reserved_orders(&self) -> OpenerSummary {
        let reserved = self.orders.list_by_status(OrderStatus::Reserved).await;
        let mut summary = OpenerSummary::default();
        for order in reserved {
            match self.open_one(&order).await {
                Ok(true) => summary.promoted += 1,
                Ok(false) => summary.cancelled += 1,
                Err(e) => {
                    summary.errors += 1;
                    error!(order_id = %order.order_id, error = %e, "reserved order promotion failed");
                }
            }
        }
        info!(
            promoted = summary.promoted,
            cancelled = summary.cancelled,
            errors = summary.errors,
            "reserved order sweep finished"
        );
        summary
    }

    /// Returns Ok(true) when the order went PENDING, Ok(false) when it was
    /// cancelled for a reservation shortfall.
    async fn open_one(&self, order: &Order) -> Result<bool, TradeError> {
        let live_price = self.oracle.current_price(&order.ticker);
        match order.side {
            Side::Sell => {
                let promoted = self
                    .orders
                    .transition_with(
                        &order.order_id,
                        OrderStatus::Reserved,
                        OrderStatus::Pending,
                        |o| o.price = live_price,
                    )
                    .await?;
                self.publish_first_attempt(&promoted, self.clock.now_utc());
                Ok(true)
            }
            Side::Buy => {
                let delta = (live_price - order.price) * order.quantity;
                if delta > 0 && !self.ledger.can_reserve(&order.account_id, delta).await {
                    // Shortfall: cancel and hand back the whole reservation.
                    self.orders
                        .transition(&order.order_id, OrderStatus::Reserved, OrderStatus::Cancelled)
                        .await?;
                    self.ledger
                        .release_cash(&order.account_id, order.notional(), &order.order_id)
                        .await?;
                    warn!(
                        order_id = %order.order_id,
                        old_price = order.price,
                        live_price,
                        delta,
                        "reserved buy cancelled, delta not reservable"
                    );
                    return Ok(false);
                }
                if delta != 0 {
                    self.ledger
                        .adjust_reservation(&order.account_id, delta, &order.order_id)
                        .await?;
                }
                let promoted = self
                    .orders
                    .transition_with(
                        &order.order_id,
                        OrderStatus::Reserved,
                        OrderStatus::Pending,
                        |o| o.price = live_price,
                    )
                    .await?;
                self.publish_first_attempt(&promoted, self.clock.now_utc());
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ChangeSign, PriceSnapshot};
    use crate::clock::ManualClock;
    use crate::config::TradingConfig;
    use crate::ledger::HistoryType;
    use crate::store::journal_channel;
    use std::sync::Arc;

    /// Admission at Sunday close, then the clock moves to Monday 09:00 and
    /// the feed publishes a live price.
    async fn reserved_setup(
        initial_cash: i64,
    ) -> (Arc<Trading>, crate::bus::BusReceivers, Arc<ManualClock>) {
        let (tx, _rx) = journal_channel();
        let clock = ManualClock::at_kst(2025, 6, 1, 18, 0, 0); // Sunday
        let cfg = TradingConfig { initial_cash, ..TradingConfig::default() };
        let (t, receivers) = Trading::new(cfg, clock.clone(), tx);
        (t, receivers, clock)
    }

    fn publish_live(t: &Trading, ticker: &str, price: i64) {
        let now = t.clock.now_utc();
        t.cache.put_price(PriceSnapshot {
            ticker: ticker.to_string(),
            last_price: price,
            change_sign: ChangeSign::Up,
            change_amount: 0,
            change_rate: 0.0,
            volume: 1,
            trade_time: now,
            received_at: now,
        });
    }

    #[tokio::test]
    async fn price_rise_reserves_delta_and_promotes() {
        let (t, mut rx, clock) = reserved_setup(1_000_000).await;
        let order = t.submit_buy("u1", "000660", 2, Some(100_000)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Reserved);
        assert_eq!(t.ledger.balance(&order.account_id).await.unwrap(), 800_000);

        clock.set(crate::clock::kst_datetime(2025, 6, 2, 9, 0, 0));
        publish_live(&t, "000660", 110_000);

        let summary = t.open_reserved_orders().await;
        assert_eq!(summary, OpenerSummary { promoted: 1, cancelled: 0, errors: 0 });

        let promoted = t.orders.get(&order.order_id).await.unwrap();
        assert_eq!(promoted.status, OrderStatus::Pending);
        assert_eq!(promoted.price, 110_000);
        // Reservation grew by the delta of 20,000.
        assert_eq!(t.ledger.balance(&order.account_id).await.unwrap(), 780_000);

        let history = t.ledger.history(&order.account_id).await;
        assert_eq!(history.last().unwrap().kind, HistoryType::ReserveAdjust);
        assert_eq!(history.last().unwrap().amount, -20_000);

        let idx = t.bus.partition_for(&order.order_id);
        assert_eq!(rx.active[idx].try_recv().unwrap().order_id, order.order_id);
    }

    #[tokio::test]
    async fn shortfall_cancels_and_refunds_in_full() {
        let (t, mut rx, clock) = reserved_setup(210_000).await;
        let order = t.submit_buy("u1", "000660", 2, Some(100_000)).await.unwrap();
        assert_eq!(t.ledger.balance(&order.account_id).await.unwrap(), 10_000);

        clock.set(crate::clock::kst_datetime(2025, 6, 2, 9, 0, 0));
        publish_live(&t, "000660", 130_000); // delta +60,000, only 10,000 left

        let summary = t.open_reserved_orders().await;
        assert_eq!(summary, OpenerSummary { promoted: 0, cancelled: 1, errors: 0 });

        let cancelled = t.orders.get(&order.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        // Original limit price is preserved on the cancelled row.
        assert_eq!(cancelled.price, 100_000);
        assert_eq!(t.ledger.balance(&order.account_id).await.unwrap(), 210_000);

        let history = t.ledger.history(&order.account_id).await;
        assert_eq!(history.last().unwrap().kind, HistoryType::Refund);
        assert_eq!(history.last().unwrap().amount, 200_000);

        let idx = t.bus.partition_for(&order.order_id);
        assert!(rx.active[idx].try_recv().is_err());
    }

    #[tokio::test]
    async fn price_drop_refunds_excess() {
        let (t, _rx, clock) = reserved_setup(1_000_000).await;
        let order = t.submit_buy("u1", "000660", 2, Some(100_000)).await.unwrap();

        clock.set(crate::clock::kst_datetime(2025, 6, 2, 9, 0, 0));
        publish_live(&t, "000660", 95_000); // delta -10,000

        let summary = t.open_reserved_orders().await;
        assert_eq!(summary.promoted, 1);

        let promoted = t.orders.get(&order.order_id).await.unwrap();
        assert_eq!(promoted.price, 95_000);
        assert_eq!(t.ledger.balance(&order.account_id).await.unwrap(), 810_000);

        let history = t.ledger.history(&order.account_id).await;
        assert_eq!(history.last().unwrap().kind, HistoryType::ReserveAdjust);
        assert_eq!(history.last().unwrap().amount, 10_000);
    }

    #[tokio::test]
    async fn unchanged_price_promotes_without_ledger_rows() {
        let (t, _rx, clock) = reserved_setup(1_000_000).await;
        let order = t.submit_buy("u1", "000660", 2, Some(100_000)).await.unwrap();
        let rows_before = t.ledger.history(&order.account_id).await.len();

        clock.set(crate::clock::kst_datetime(2025, 6, 2, 9, 0, 0));
        publish_live(&t, "000660", 100_000);

        t.open_reserved_orders().await;
        assert_eq!(t.orders.get(&order.order_id).await.unwrap().status, OrderStatus::Pending);
        assert_eq!(t.ledger.history(&order.account_id).await.len(), rows_before);
    }

    #[tokio::test]
    async fn reserved_sell_reanchors_and_goes_pending() {
        let (t, mut rx, clock) = reserved_setup(1_000_000).await;
        let account = t.ledger.create_account("u1").await;
        t.ledger
            .apply_buy_fill(&account.account_id, "035420", 3, 180_000)
            .await
            .unwrap();
        let order = t.submit_sell("u1", "035420", 2, Some(190_000)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Reserved);

        clock.set(crate::clock::kst_datetime(2025, 6, 2, 9, 0, 0));
        publish_live(&t, "035420", 200_000);

        let summary = t.open_reserved_orders().await;
        assert_eq!(summary.promoted, 1);

        let promoted = t.orders.get(&order.order_id).await.unwrap();
        assert_eq!(promoted.status, OrderStatus::Pending);
        assert_eq!(promoted.price, 200_000);
        // No cash moves for sells at open.
        assert_eq!(t.ledger.balance(&account.account_id).await.unwrap(), 1_000_000);

        let idx = t.bus.partition_for(&order.order_id);
        assert_eq!(rx.active[idx].try_recv().unwrap().order_id, order.order_id);
    }

    #[tokio::test]
    async fn sweep_isolates_per_order_failures() {
        let (t, _rx, clock) = reserved_setup(1_000_000).await;
        let good = t.submit_buy("u1", "000660", 1, Some(100_000)).await.unwrap();
        // An order whose account vanished would error; simulate by moving
        // one order to a terminal state behind the sweep's back.
        let doomed = t.submit_buy("u2", "005930", 1, Some(70_000)).await.unwrap();
        t.orders
            .transition(&doomed.order_id, OrderStatus::Reserved, OrderStatus::Cancelled)
            .await
            .unwrap();

        clock.set(crate::clock::kst_datetime(2025, 6, 2, 9, 0, 0));
        publish_live(&t, "000660", 100_000);
        publish_live(&t, "005930", 70_000);

        let summary = t.open_reserved_orders().await;
        // The cancelled order is no longer RESERVED and never enters the
        // sweep; the good one still promotes.
        assert_eq!(summary.promoted, 1);
        assert_eq!(t.orders.get(&good.order_id).await.unwrap().status, OrderStatus::Pending);
    }
}
