use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::TradingConfig;

/// Direction of the last tick relative to the prior close, mirroring the
/// vendor feed's five-valued sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSign {
    UpLimit,
    Up,
    Flat,
    DownLimit,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub ticker: String,
    pub last_price: i64,
    pub change_sign: ChangeSign,
    pub change_amount: i64,
    pub change_rate: f64,
    pub volume: i64,
    pub trade_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

pub const BOOK_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub ticker: String,
    pub asks: Vec<BookLevel>,
    pub bids: Vec<BookLevel>,
    pub received_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_ask(&self) -> Option<i64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn best_bid(&self) -> Option<i64> {
        self.bids.first().map(|l| l.price)
    }
}

/// Retry bookkeeping for one order: how many probabilistic attempts have
/// been scheduled and when the next one becomes eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub order_id: String,
    pub retry_count: u32,
    pub next_eligible_at: DateTime<Utc>,
}

struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// In-process rendition of the realtime cache: `realtime:stock:{ticker}`,
/// `realtime:orderbook:{ticker}`, `close:{ticker}`, `retry:count:{orderId}`.
/// Writes are last-writer-wins; reads never block and a miss is normal.
pub struct PriceCache {
    clock: Arc<dyn Clock>,
    price_ttl: Duration,
    book_ttl: Duration,
    close_ttl: Duration,
    retry_ttl: Duration,
    prices: DashMap<String, Expiring<PriceSnapshot>>,
    books: DashMap<String, Expiring<OrderBookSnapshot>>,
    closes: DashMap<String, Expiring<i64>>,
    retries: DashMap<String, Expiring<RetryRecord>>,
}

impl PriceCache {
    pub fn new(cfg: &TradingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            price_ttl: Duration::seconds(cfg.price_ttl_secs),
            book_ttl: Duration::seconds(cfg.book_ttl_secs),
            close_ttl: Duration::seconds(cfg.close_ttl_secs),
            retry_ttl: Duration::seconds(cfg.retry_record_ttl_secs),
            prices: DashMap::new(),
            books: DashMap::new(),
            closes: DashMap::new(),
            retries: DashMap::new(),
        }
    }

    pub fn put_price(&self, snapshot: PriceSnapshot) {
        let expires_at = self.clock.now_utc() + self.price_ttl;
        self.prices
            .insert(snapshot.ticker.clone(), Expiring { value: snapshot, expires_at });
    }

    pub fn get_price(&self, ticker: &str) -> Option<PriceSnapshot> {
        read_live(&self.prices, ticker, self.clock.now_utc())
    }

    pub fn put_book(&self, snapshot: OrderBookSnapshot) {
        let expires_at = self.clock.now_utc() + self.book_ttl;
        self.books
            .insert(snapshot.ticker.clone(), Expiring { value: snapshot, expires_at });
    }

    pub fn get_book(&self, ticker: &str) -> Option<OrderBookSnapshot> {
        read_live(&self.books, ticker, self.clock.now_utc())
    }

    pub fn put_close(&self, ticker: &str, price: i64) {
        let expires_at = self.clock.now_utc() + self.close_ttl;
        self.closes
            .insert(ticker.to_string(), Expiring { value: price, expires_at });
    }

    pub fn get_close(&self, ticker: &str) -> Option<i64> {
        read_live(&self.closes, ticker, self.clock.now_utc())
    }

    /// Tickers with a live trade snapshot, the `realtime:stock:*` scan.
    pub fn list_active_tickers(&self) -> Vec<String> {
        let now = self.clock.now_utc();
        let mut out: Vec<String> = self
            .prices
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    pub fn put_retry_record(&self, record: RetryRecord) {
        let expires_at = self.clock.now_utc() + self.retry_ttl;
        self.retries
            .insert(record.order_id.clone(), Expiring { value: record, expires_at });
    }

    pub fn get_retry_record(&self, order_id: &str) -> Option<RetryRecord> {
        read_live(&self.retries, order_id, self.clock.now_utc())
    }

    pub fn clear_retry_record(&self, order_id: &str) {
        self.retries.remove(order_id);
    }

    /// Drop expired entries. Reads already ignore them; this reclaims the
    /// memory, run from the nightly cleanup job.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_utc();
        let before = self.prices.len() + self.books.len() + self.closes.len() + self.retries.len();
        self.prices.retain(|_, e| e.expires_at > now);
        self.books.retain(|_, e| e.expires_at > now);
        self.closes.retain(|_, e| e.expires_at > now);
        self.retries.retain(|_, e| e.expires_at > now);
        before - (self.prices.len() + self.books.len() + self.closes.len() + self.retries.len())
    }

    pub fn live_snapshot_count(&self) -> usize {
        let now = self.clock.now_utc();
        self.prices.iter().filter(|e| e.value().expires_at > now).count()
    }

    /// Drop every entry for one ticker ahead of a manual re-subscribe.
    pub fn clear_ticker(&self, ticker: &str) {
        self.prices.remove(ticker);
        self.books.remove(ticker);
        self.closes.remove(ticker);
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_utc();
        CacheStats {
            prices: self.prices.iter().filter(|e| e.value().expires_at > now).count(),
            books: self.books.iter().filter(|e| e.value().expires_at > now).count(),
            closes: self.closes.iter().filter(|e| e.value().expires_at > now).count(),
            retries: self.retries.iter().filter(|e| e.value().expires_at > now).count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub prices: usize,
    pub books: usize,
    pub closes: usize,
    pub retries: usize,
}

fn read_live<T: Clone>(
    map: &DashMap<String, Expiring<T>>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<T> {
    let entry = map.get(key)?;
    if entry.expires_at <= now {
        return None;
    }
    Some(entry.value.clone())
}
