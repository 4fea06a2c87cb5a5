use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::cache::{BookLevel, ChangeSign, OrderBookSnapshot, PriceSnapshot, BOOK_DEPTH};
use crate::state::Trading;
use crate::stocks::{self, StockCatalog};

/// The external feed's entire contract with the core is `put_price` /
/// `put_book` on the cache. This module is the built-in stand-in: a
/// random-walk generator over the seed tickers in the style of a vendor
/// tick stream.
const FEED_TICK_MS: u64 = 1_000;

/// Pre-open subscription refresh: make sure every seed ticker has a prior
/// close to anchor the oracle and the walk before live data arrives.
pub fn refresh_subscriptions(trading: &Trading) -> usize {
    let mut primed = 0usize;
    for ticker in StockCatalog::seed_tickers() {
        if trading.cache.get_close(ticker).is_none() {
            trading.cache.put_close(ticker, stocks::default_price(ticker));
            primed += 1;
        }
    }
    info!(primed, "feed subscriptions refreshed");
    primed
}

pub async fn run_mock_feed(trading: Arc<Trading>) {
    info!("mock feed started");
    let mut last: HashMap<&'static str, i64> = HashMap::new();
    for ticker in StockCatalog::seed_tickers() {
        let base = trading
            .cache
            .get_close(ticker)
            .unwrap_or_else(|| stocks::default_price(ticker));
        last.insert(ticker, base);
    }

    let mut interval = tokio::time::interval(Duration::from_millis(FEED_TICK_MS));
    loop {
        interval.tick().await;
        for ticker in StockCatalog::seed_tickers() {
            let price = last.get_mut(ticker).expect("seeded ticker");
            let tick = publish_tick(&trading, ticker, *price);
            *price = tick;
        }
    }
}

fn publish_tick(trading: &Trading, ticker: &str, prev: i64) -> i64 {
    let mut rng = rand::thread_rng();
    let tick_size = (prev / 1_000).max(10);
    let steps: i64 = rng.gen_range(-5..=5);
    let price = (prev + steps * tick_size).max(tick_size);
    let change = price - prev;
    let now = trading.clock.now_utc();

    trading.cache.put_price(PriceSnapshot {
        ticker: ticker.to_string(),
        last_price: price,
        change_sign: sign_for(change),
        change_amount: change,
        change_rate: if prev > 0 { change as f64 / prev as f64 * 100.0 } else { 0.0 },
        volume: rng.gen_range(1_000..500_000),
        trade_time: now,
        received_at: now,
    });

    let mut asks = Vec::with_capacity(BOOK_DEPTH);
    let mut bids = Vec::with_capacity(BOOK_DEPTH);
    for level in 1..=BOOK_DEPTH as i64 {
        asks.push(BookLevel {
            price: price + level * tick_size,
            size: rng.gen_range(100..5_000),
        });
        bids.push(BookLevel {
            price: (price - level * tick_size).max(tick_size),
            size: rng.gen_range(100..5_000),
        });
    }
    trading.cache.put_book(OrderBookSnapshot {
        ticker: ticker.to_string(),
        asks,
        bids,
        received_at: now,
    });

    price
}

fn sign_for(change: i64) -> ChangeSign {
    match change.signum() {
        1 => ChangeSign::Up,
        -1 => ChangeSign::Down,
        _ => ChangeSign::Flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TradingConfig;
    use crate::store::journal_channel;

    fn core() -> Arc<Trading> {
        let (tx, _rx) = journal_channel();
        let clock = ManualClock::at_kst(2025, 6, 2, 10, 0, 0);
        Trading::new(TradingConfig::default(), clock, tx).0
    }

    #[test]
    fn refresh_primes_missing_closes_once() {
        let t = core();
        assert_eq!(refresh_subscriptions(&t), 10);
        assert_eq!(t.cache.get_close("005930"), Some(70_000));
        // Second run finds everything primed.
        assert_eq!(refresh_subscriptions(&t), 0);
    }

    #[test]
    fn tick_publishes_price_and_ten_deep_book() {
        let t = core();
        let next = publish_tick(&t, "005930", 70_000);
        assert!(next > 0);

        let snap = t.cache.get_price("005930").unwrap();
        assert_eq!(snap.last_price, next);

        let book = t.cache.get_book("005930").unwrap();
        assert_eq!(book.asks.len(), BOOK_DEPTH);
        assert_eq!(book.bids.len(), BOOK_DEPTH);
        // Book brackets the last trade.
        assert!(book.best_ask().unwrap() > next);
        assert!(book.best_bid().unwrap() < next);
    }
}
