use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub trading: TradingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub max_lifetime_seconds: u64,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Trading tunables. Every value the matching pipeline depends on lives here
/// so tests can shrink delays and windows to microseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    /// Cash granted to a freshly created account, in minor units.
    pub initial_cash: i64,
    pub max_order_qty: i64,
    pub max_order_price: i64,
    /// Per-attempt fill probability is drawn uniformly from [floor, ceiling).
    pub fill_rate_floor: f64,
    pub fill_rate_ceiling: f64,
    pub retry_delay_secs: i64,
    /// Attempts 1..=max are probabilistic; the attempt after that is forced.
    pub max_retry_count: u32,
    /// Minutes since local midnight, KST.
    pub market_open_minute: u32,
    pub market_close_minute: u32,
    /// A cached price older than this is no longer treated as live.
    pub freshness_window_secs: i64,
    pub price_ttl_secs: i64,
    pub book_ttl_secs: i64,
    pub close_ttl_secs: i64,
    pub retry_record_ttl_secs: i64,
    pub active_workers: usize,
    pub mock_feed: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            initial_cash: 1_000_000,
            max_order_qty: 10_000,
            max_order_price: 10_000_000,
            fill_rate_floor: 0.65,
            fill_rate_ceiling: 0.75,
            retry_delay_secs: 180,
            max_retry_count: 5,
            market_open_minute: 9 * 60,
            market_close_minute: 15 * 60 + 30,
            freshness_window_secs: 300,
            price_ttl_secs: 60,
            book_ttl_secs: 60,
            close_ttl_secs: 7 * 24 * 3600,
            retry_record_ttl_secs: 24 * 3600,
            active_workers: 3,
            mock_feed: true,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    let defaults = TradingConfig::default();
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 5),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 30),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("API_PORT", 8000),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        trading: TradingConfig {
            initial_cash: env_i64("INITIAL_CASH", defaults.initial_cash),
            max_order_qty: env_i64("MAX_ORDER_QTY", defaults.max_order_qty),
            max_order_price: env_i64("MAX_ORDER_PRICE", defaults.max_order_price),
            fill_rate_floor: env_f64("FILL_RATE_FLOOR", defaults.fill_rate_floor),
            fill_rate_ceiling: env_f64("FILL_RATE_CEILING", defaults.fill_rate_ceiling),
            retry_delay_secs: env_i64("RETRY_DELAY_SECS", defaults.retry_delay_secs),
            max_retry_count: env_u32("MAX_RETRY_COUNT", defaults.max_retry_count),
            market_open_minute: env_u32("MARKET_OPEN_MINUTE", defaults.market_open_minute),
            market_close_minute: env_u32("MARKET_CLOSE_MINUTE", defaults.market_close_minute),
            freshness_window_secs: env_i64("FRESHNESS_WINDOW_SECS", defaults.freshness_window_secs),
            price_ttl_secs: env_i64("PRICE_TTL_SECS", defaults.price_ttl_secs),
            book_ttl_secs: env_i64("BOOK_TTL_SECS", defaults.book_ttl_secs),
            close_ttl_secs: env_i64("CLOSE_TTL_SECS", defaults.close_ttl_secs),
            retry_record_ttl_secs: env_i64("RETRY_RECORD_TTL_SECS", defaults.retry_record_ttl_secs),
            active_workers: env_u32("ACTIVE_WORKERS", defaults.active_workers as u32) as usize,
            mock_feed: env_bool("MOCK_FEED", defaults.mock_feed),
        },
    };
    if cfg.trading.fill_rate_floor < 0.0
        || cfg.trading.fill_rate_ceiling > 1.0
        || cfg.trading.fill_rate_floor > cfg.trading.fill_rate_ceiling
    {
        return Err(anyhow!("fill rate bounds must satisfy 0 <= floor <= ceiling <= 1"));
    }
    if cfg.trading.market_open_minute >= cfg.trading.market_close_minute {
        return Err(anyhow!("market open must precede market close"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}
