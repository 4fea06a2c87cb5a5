use std::sync::Arc;

use chrono::Duration;

use crate::cache::{PriceCache, PriceSnapshot};
use crate::clock::{Clock, MarketCalendar};
use crate::config::TradingConfig;
use crate::stocks;

/// Resolves the price admission and execution should use for a ticker.
///
/// Resolution order:
/// 1. live snapshot inside the freshness window while the market is open
/// 2. prior close
/// 3. stale snapshot while the market is closed
/// 4. static per-ticker default, or the system default for unknown tickers
pub struct PriceOracle {
    clock: Arc<dyn Clock>,
    calendar: MarketCalendar,
    cache: Arc<PriceCache>,
    freshness_window: Duration,
}

impl PriceOracle {
    pub fn new(cfg: &TradingConfig, clock: Arc<dyn Clock>, cache: Arc<PriceCache>) -> Self {
        Self {
            clock,
            calendar: MarketCalendar::new(cfg),
            cache,
            freshness_window: Duration::seconds(cfg.freshness_window_secs),
        }
    }

    pub fn is_fresh(&self, snapshot: &PriceSnapshot) -> bool {
        self.clock.now_utc() - snapshot.received_at < self.freshness_window
    }

    pub fn current_price(&self, ticker: &str) -> i64 {
        let market_open = self.calendar.is_open_at(self.clock.now_utc());
        let cached = self.cache.get_price(ticker);

        if market_open {
            if let Some(snap) = cached.as_ref().filter(|s| self.is_fresh(s)) {
                return snap.last_price;
            }
        }
        if let Some(close) = self.cache.get_close(ticker) {
            return close;
        }
        if !market_open {
            if let Some(snap) = cached {
                return snap.last_price;
            }
        }
        stocks::default_price(ticker)
    }
}
