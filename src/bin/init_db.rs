use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

use stocksim::stocks::StockCatalog;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS account (
        account_id            TEXT PRIMARY KEY,
        user_id               TEXT NOT NULL,
        status                TEXT NOT NULL,
        cash_balance          BIGINT NOT NULL,
        withdrawable_balance  BIGINT NOT NULL,
        created_at            TIMESTAMPTZ NOT NULL,
        updated_at            TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS account_user_idx ON account (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS account_history (
        history_id        TEXT PRIMARY KEY,
        account_id        TEXT NOT NULL,
        kind              TEXT NOT NULL,
        related_order_id  TEXT,
        amount            BIGINT NOT NULL,
        balance_before    BIGINT NOT NULL,
        balance_after     BIGINT NOT NULL,
        at                TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS account_history_account_idx ON account_history (account_id, at)",
    r#"
    CREATE TABLE IF NOT EXISTS holding (
        hold_id     TEXT PRIMARY KEY,
        account_id  TEXT NOT NULL,
        ticker      TEXT NOT NULL,
        quantity    BIGINT NOT NULL,
        avg_cost    BIGINT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS holding_account_ticker_idx ON holding (account_id, ticker)",
    r#"
    CREATE TABLE IF NOT EXISTS stock (
        ticker     TEXT PRIMARY KEY,
        name       TEXT NOT NULL,
        sector     TEXT NOT NULL,
        status     TEXT NOT NULL,
        listed_at  DATE NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_buy (
        order_id    TEXT PRIMARY KEY,
        account_id  TEXT NOT NULL,
        ticker      TEXT NOT NULL,
        holding_id  TEXT,
        price       BIGINT NOT NULL,
        quantity    BIGINT NOT NULL,
        status      TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS stock_buy_account_status_idx ON stock_buy (account_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS stock_sell (
        order_id    TEXT PRIMARY KEY,
        account_id  TEXT NOT NULL,
        ticker      TEXT NOT NULL,
        holding_id  TEXT,
        price       BIGINT NOT NULL,
        quantity    BIGINT NOT NULL,
        status      TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS stock_sell_account_status_idx ON stock_sell (account_id, status)",
];

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = std::env::var("DATABASE_URL").context("missing required env var: DATABASE_URL")?;
    let db = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(&db)
            .await
            .with_context(|| format!("exec schema stmt: {}", stmt.lines().find(|l| !l.trim().is_empty()).unwrap_or("<empty>")))?;
    }

    let catalog = StockCatalog::with_seed();
    let mut seeded = 0usize;
    for stock in catalog.all() {
        sqlx::query(
            r#"
            INSERT INTO stock (ticker, name, sector, status, listed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (ticker) DO NOTHING
            "#,
        )
        .bind(&stock.ticker)
        .bind(&stock.name)
        .bind(&stock.sector)
        .bind(match stock.status {
            stocksim::stocks::StockStatus::Listed => "LISTED",
            stocksim::stocks::StockStatus::Delisted => "DELISTED",
        })
        .bind(stock.listed_at)
        .execute(&db)
        .await?;
        seeded += 1;
    }

    println!("initialized: tables={}, stocks={}", SCHEMA.len(), seeded);
    Ok(())
}
