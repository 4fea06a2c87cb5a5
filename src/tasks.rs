use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use tracing::{info, warn};

use crate::clock::kst;
use crate::feed;
use crate::orders::{OrderStatus, Side};
use crate::state::Trading;

/// Job schedule, KST: 08:50 feed refresh, 09:00 reservation opener, 15:35
/// close-price save + pending cleanup (all Mon-Fri), 00:00 cache sweep,
/// and a half-hourly health line.
const FEED_REFRESH_MINUTE: u32 = 8 * 60 + 50;
const OPENER_MINUTE: u32 = 9 * 60;
const CLOSE_CLEANUP_MINUTE: u32 = 15 * 60 + 35;
const NIGHTLY_SWEEP_MINUTE: u32 = 0;
const HEALTH_INTERVAL_SECS: u64 = 30 * 60;

pub fn start_scheduled_jobs(trading: Arc<Trading>) {
    tokio::spawn(run_daily(trading.clone(), FEED_REFRESH_MINUTE, true, |t| async move {
        feed::refresh_subscriptions(&t);
    }));
    tokio::spawn(run_daily(trading.clone(), OPENER_MINUTE, true, |t| async move {
        t.open_reserved_orders().await;
    }));
    tokio::spawn(run_daily(trading.clone(), CLOSE_CLEANUP_MINUTE, true, |t| async move {
        let saved = t.save_close_prices().await;
        let cancelled = t.cancel_pending_orders().await;
        info!(saved, cancelled, "market close sweep finished");
    }));
    tokio::spawn(run_daily(trading.clone(), NIGHTLY_SWEEP_MINUTE, false, |t| async move {
        let swept = t.cache.sweep_expired();
        info!(swept, "nightly cache sweep finished");
    }));
    tokio::spawn(run_health_log(trading));
}

async fn run_daily<F, Fut>(trading: Arc<Trading>, minute_of_day: u32, weekdays_only: bool, job: F)
where
    F: Fn(Arc<Trading>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let now = trading.clock.now_utc();
        let next = next_run_after(now, minute_of_day, weekdays_only);
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        job(trading.clone()).await;
    }
}

async fn run_health_log(trading: Arc<Trading>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(HEALTH_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let now = trading.clock.now_utc();
        info!(
            market_open = trading.calendar.is_open_at(now),
            live_snapshots = trading.cache.live_snapshot_count(),
            next_open = %trading.calendar.next_open(now),
            "system health"
        );
    }
}

/// Next KST wall-clock occurrence of `minute_of_day` strictly after `now`,
/// optionally skipping weekends.
pub fn next_run_after(now: DateTime<Utc>, minute_of_day: u32, weekdays_only: bool) -> DateTime<Utc> {
    let local = now.with_timezone(&kst());
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)
        .expect("valid minute of day");
    let mut day = local.date_naive();
    if local.time() >= time {
        day = day.succ_opt().expect("date in range");
    }
    while weekdays_only && matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day = day.succ_opt().expect("date in range");
    }
    kst()
        .from_local_datetime(&day.and_time(time))
        .single()
        .expect("fixed offset is unambiguous")
        .with_timezone(&Utc)
}

impl Trading {
    /// Capture every live last-trade price as the prior close (7-day TTL),
    /// run at market close before the pending cleanup.
    pub async fn save_close_prices(&self) -> usize {
        let mut saved = 0usize;
        for ticker in self.cache.list_active_tickers() {
            if let Some(snap) = self.cache.get_price(&ticker) {
                self.cache.put_close(&ticker, snap.last_price);
                saved += 1;
            }
        }
        saved
    }

    /// Cancel every order still PENDING after the close: buys get their
    /// reservation back, sells simply stop. Claimed optimistically, so an
    /// order a worker settles concurrently is skipped.
    pub async fn cancel_pending_orders(&self) -> usize {
        let pending = self.orders.list_by_status(OrderStatus::Pending).await;
        let mut cancelled = 0usize;
        for order in pending {
            match self
                .orders
                .transition(&order.order_id, OrderStatus::Pending, OrderStatus::Cancelled)
                .await
            {
                Ok(_) => {
                    if order.side == Side::Buy {
                        if let Err(e) = self
                            .ledger
                            .release_cash(&order.account_id, order.notional(), &order.order_id)
                            .await
                        {
                            warn!(order_id = %order.order_id, error = %e, "cleanup refund failed");
                        }
                    }
                    self.cache.clear_retry_record(&order.order_id);
                    cancelled += 1;
                }
                Err(_) => {
                    // Lost the claim to a concurrent fill; leave it alone.
                    continue;
                }
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ChangeSign, PriceSnapshot};
    use crate::clock::{kst_datetime, Clock, ManualClock};
    use crate::config::TradingConfig;
    use crate::ledger::HistoryType;
    use crate::store::journal_channel;

    #[test]
    fn next_run_rolls_day_and_weekend() {
        // Monday 10:00, job at 09:00 -> Tuesday 09:00.
        let now = kst_datetime(2025, 6, 2, 10, 0, 0);
        assert_eq!(next_run_after(now, 9 * 60, true), kst_datetime(2025, 6, 3, 9, 0, 0));

        // Friday 16:00, weekday job -> Monday.
        let now = kst_datetime(2025, 6, 6, 16, 0, 0);
        assert_eq!(next_run_after(now, 9 * 60, true), kst_datetime(2025, 6, 9, 9, 0, 0));

        // Friday 16:00, daily job -> Saturday 00:00.
        assert_eq!(next_run_after(now, 0, false), kst_datetime(2025, 6, 7, 0, 0, 0));

        // Before today's slot: same day.
        let now = kst_datetime(2025, 6, 2, 8, 0, 0);
        assert_eq!(next_run_after(now, 8 * 60 + 50, true), kst_datetime(2025, 6, 2, 8, 50, 0));
    }

    fn core_at(hour: u32) -> (std::sync::Arc<Trading>, std::sync::Arc<ManualClock>) {
        let (tx, _rx) = journal_channel();
        let clock = ManualClock::at_kst(2025, 6, 2, hour, 0, 0);
        let (t, _receivers) = Trading::new(TradingConfig::default(), clock.clone(), tx);
        (t, clock)
    }

    #[tokio::test]
    async fn close_sweep_saves_live_prices() {
        let (t, clock) = core_at(15);
        let now = clock.now_utc();
        t.cache.put_price(PriceSnapshot {
            ticker: "005930".to_string(),
            last_price: 71_500,
            change_sign: ChangeSign::Up,
            change_amount: 1_500,
            change_rate: 2.1,
            volume: 100,
            trade_time: now,
            received_at: now,
        });
        assert_eq!(t.save_close_prices().await, 1);
        assert_eq!(t.cache.get_close("005930"), Some(71_500));
    }

    #[tokio::test]
    async fn pending_cleanup_cancels_and_refunds_buys() {
        let (t, _clock) = core_at(10);
        let buy = t.submit_buy("u1", "005930", 2, Some(70_000)).await.unwrap();
        let account = t.ledger.create_account("u2").await;
        t.ledger
            .apply_buy_fill(&account.account_id, "035420", 3, 180_000)
            .await
            .unwrap();
        let sell = t.submit_sell("u2", "035420", 1, Some(200_000)).await.unwrap();

        assert_eq!(t.cancel_pending_orders().await, 2);

        assert_eq!(t.orders.get(&buy.order_id).await.unwrap().status, OrderStatus::Cancelled);
        assert_eq!(t.orders.get(&sell.order_id).await.unwrap().status, OrderStatus::Cancelled);

        // The buy reservation came back in a REFUND row.
        let balance = t.ledger.balance(&buy.account_id).await.unwrap();
        assert_eq!(balance, 1_000_000);
        let history = t.ledger.history(&buy.account_id).await;
        assert_eq!(history.last().unwrap().kind, HistoryType::Refund);

        // Sell cancellation touches no cash.
        assert_eq!(t.ledger.balance(&account.account_id).await.unwrap(), 1_000_000);
    }

    #[tokio::test]
    async fn cleanup_skips_already_settled_orders() {
        let (t, _clock) = core_at(10);
        let buy = t.submit_buy("u1", "005930", 1, Some(70_000)).await.unwrap();
        t.orders
            .transition(&buy.order_id, OrderStatus::Pending, OrderStatus::Executed)
            .await
            .unwrap();
        assert_eq!(t.cancel_pending_orders().await, 0);
        assert_eq!(t.orders.get(&buy.order_id).await.unwrap().status, OrderStatus::Executed);
    }
}
