use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::TradeError;

/// Price returned for tickers with no cached data and no static entry.
pub const SYSTEM_DEFAULT_PRICE: i64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    Listed,
    Delisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub ticker: String,
    pub name: String,
    pub sector: String,
    pub status: StockStatus,
    pub listed_at: NaiveDate,
}

/// Reference catalog of listed tickers. Seeded in-process; the init tool
/// writes the same rows to the `stock` table.
pub struct StockCatalog {
    stocks: DashMap<String, Stock>,
}

struct Seed {
    ticker: &'static str,
    name: &'static str,
    sector: &'static str,
    default_price: i64,
}

const SEED_STOCKS: &[Seed] = &[
    Seed { ticker: "005930", name: "Samsung Electronics", sector: "Semiconductors", default_price: 70_000 },
    Seed { ticker: "000660", name: "SK Hynix", sector: "Semiconductors", default_price: 120_000 },
    Seed { ticker: "035420", name: "NAVER", sector: "Platforms", default_price: 200_000 },
    Seed { ticker: "051910", name: "LG Chem", sector: "Chemicals", default_price: 300_000 },
    Seed { ticker: "006400", name: "Samsung SDI", sector: "Chemicals", default_price: 250_000 },
    Seed { ticker: "207940", name: "Samsung Biologics", sector: "Biotech", default_price: 800_000 },
    Seed { ticker: "005380", name: "Hyundai Motor", sector: "Automotive", default_price: 180_000 },
    Seed { ticker: "012330", name: "Hyundai Mobis", sector: "Automotive", default_price: 250_000 },
    Seed { ticker: "028260", name: "Samsung C&T", sector: "Industrials", default_price: 120_000 },
    Seed { ticker: "066570", name: "LG Electronics", sector: "Electronics", default_price: 130_000 },
];

impl StockCatalog {
    pub fn with_seed() -> Self {
        let stocks = DashMap::new();
        for s in SEED_STOCKS {
            stocks.insert(
                s.ticker.to_string(),
                Stock {
                    ticker: s.ticker.to_string(),
                    name: s.name.to_string(),
                    sector: s.sector.to_string(),
                    status: StockStatus::Listed,
                    listed_at: NaiveDate::from_ymd_opt(2000, 1, 4).expect("valid date"),
                },
            );
        }
        Self { stocks }
    }

    pub fn get(&self, ticker: &str) -> Option<Stock> {
        self.stocks.get(ticker).map(|s| s.clone())
    }

    pub fn insert(&self, stock: Stock) {
        self.stocks.insert(stock.ticker.clone(), stock);
    }

    pub fn is_listed(&self, ticker: &str) -> bool {
        self.stocks
            .get(ticker)
            .map(|s| s.status == StockStatus::Listed)
            .unwrap_or(false)
    }

    pub fn all(&self) -> Vec<Stock> {
        self.stocks.iter().map(|e| e.value().clone()).collect()
    }

    pub fn seed_tickers() -> Vec<&'static str> {
        SEED_STOCKS.iter().map(|s| s.ticker).collect()
    }
}

/// Static fallback table for the price oracle. Tickers outside the table
/// resolve to the system default.
pub fn default_price(ticker: &str) -> i64 {
    SEED_STOCKS
        .iter()
        .find(|s| s.ticker == ticker)
        .map(|s| s.default_price)
        .unwrap_or(SYSTEM_DEFAULT_PRICE)
}

/// Normalize user ticker input to the canonical 6-digit form: strip
/// non-digits, then left-pad with zeros. `"5930"` and `" 005930 "` both
/// normalize to `"005930"`.
pub fn normalize_ticker(input: &str) -> Result<String, TradeError> {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 6 {
        return Err(TradeError::InvalidArgument(format!(
            "ticker must be a 6-digit code: {input:?}"
        )));
    }
    Ok(format!("{digits:0>6}"))
}

pub fn is_valid_ticker_format(ticker: &str) -> bool {
    ticker.len() == 6 && ticker.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_partial_and_padded_input() {
        assert_eq!(normalize_ticker("5930").unwrap(), "005930");
        assert_eq!(normalize_ticker(" 005930 ").unwrap(), "005930");
        assert_eq!(normalize_ticker("000660").unwrap(), "000660");
    }

    #[test]
    fn rejects_garbage_tickers() {
        assert!(normalize_ticker("").is_err());
        assert!(normalize_ticker("abcdef").is_err());
        assert!(normalize_ticker("1234567").is_err());
    }

    #[test]
    fn format_check_requires_six_digits() {
        assert!(is_valid_ticker_format("005930"));
        assert!(!is_valid_ticker_format("5930"));
        assert!(!is_valid_ticker_format("00593a"));
    }

    #[test]
    fn default_prices_cover_seed_and_fallback() {
        assert_eq!(default_price("005930"), 70_000);
        assert_eq!(default_price("035420"), 200_000);
        assert_eq!(default_price("999999"), SYSTEM_DEFAULT_PRICE);
    }

    #[test]
    fn seed_catalog_is_listed() {
        let catalog = StockCatalog::with_seed();
        assert!(catalog.is_listed("005930"));
        assert!(!catalog.is_listed("999999"));
        assert_eq!(catalog.all().len(), 10);
    }
}
