use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::ledger::{Account, AccountHistory, AccountStatus, Holding};
use crate::orders::{Order, OrderStatus, Side};
use crate::state::Trading;

/// Write-behind persistence. Core components append events to this channel
/// from inside their own commit sections and never block on the database;
/// the writer task applies them to Postgres in arrival order.
pub type JournalTx = mpsc::UnboundedSender<JournalEvent>;

#[derive(Debug, Clone)]
pub enum JournalEvent {
    AccountUpserted(Account),
    HistoryAppended(AccountHistory),
    HoldingUpserted(Holding),
    HoldingRemoved { hold_id: String },
    OrderUpserted(Order),
}

pub fn journal_channel() -> (JournalTx, mpsc::UnboundedReceiver<JournalEvent>) {
    mpsc::unbounded_channel()
}

pub async fn run_journal_writer(
    pool: Pool<Postgres>,
    mut rx: mpsc::UnboundedReceiver<JournalEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = apply_event(&pool, &event).await {
            // The in-memory state is authoritative; a failed write is logged
            // and the row converges on the next upsert for the same key.
            error!(error = %e, "journal write failed");
        }
    }
    info!("journal writer stopped");
}

async fn apply_event(pool: &Pool<Postgres>, event: &JournalEvent) -> Result<()> {
    match event {
        JournalEvent::AccountUpserted(a) => {
            sqlx::query(
                r#"
                INSERT INTO account
                    (account_id, user_id, status, cash_balance, withdrawable_balance, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (account_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    cash_balance = EXCLUDED.cash_balance,
                    withdrawable_balance = EXCLUDED.withdrawable_balance,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&a.account_id)
            .bind(&a.user_id)
            .bind(a.status.as_str())
            .bind(a.cash_balance)
            .bind(a.withdrawable_balance)
            .bind(a.created_at)
            .bind(a.updated_at)
            .execute(pool)
            .await?;
        }
        JournalEvent::HistoryAppended(h) => {
            sqlx::query(
                r#"
                INSERT INTO account_history
                    (history_id, account_id, kind, related_order_id, amount, balance_before, balance_after, at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (history_id) DO NOTHING
                "#,
            )
            .bind(&h.history_id)
            .bind(&h.account_id)
            .bind(h.kind.as_str())
            .bind(&h.related_order_id)
            .bind(h.amount)
            .bind(h.balance_before)
            .bind(h.balance_after)
            .bind(h.at)
            .execute(pool)
            .await?;
        }
        JournalEvent::HoldingUpserted(h) => {
            sqlx::query(
                r#"
                INSERT INTO holding
                    (hold_id, account_id, ticker, quantity, avg_cost, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (hold_id) DO UPDATE SET
                    quantity = EXCLUDED.quantity,
                    avg_cost = EXCLUDED.avg_cost,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&h.hold_id)
            .bind(&h.account_id)
            .bind(&h.ticker)
            .bind(h.quantity)
            .bind(h.avg_cost)
            .bind(h.created_at)
            .bind(h.updated_at)
            .execute(pool)
            .await?;
        }
        JournalEvent::HoldingRemoved { hold_id } => {
            sqlx::query("DELETE FROM holding WHERE hold_id = $1")
                .bind(hold_id)
                .execute(pool)
                .await?;
        }
        JournalEvent::OrderUpserted(o) => {
            let table = match o.side {
                Side::Buy => "stock_buy",
                Side::Sell => "stock_sell",
            };
            let sql = format!(
                r#"
                INSERT INTO {table}
                    (order_id, account_id, ticker, holding_id, price, quantity, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (order_id) DO UPDATE SET
                    price = EXCLUDED.price,
                    status = EXCLUDED.status,
                    updated_at = EXCLUDED.updated_at
                "#
            );
            sqlx::query(&sql)
                .bind(&o.order_id)
                .bind(&o.account_id)
                .bind(&o.ticker)
                .bind(&o.holding_id)
                .bind(o.price)
                .bind(o.quantity)
                .bind(o.status.as_str())
                .bind(o.created_at)
                .bind(o.updated_at)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Re-hydrate the in-memory ledger and order store from the journal tables
/// at startup. Restore paths bypass journaling so replay does not write the
/// rows straight back.
pub async fn replay_from_db(pool: &Pool<Postgres>, trading: &Trading) -> Result<()> {
    let mut accounts = 0usize;
    let rows = sqlx::query("SELECT account_id, user_id, status, cash_balance, withdrawable_balance, created_at, updated_at FROM account")
        .fetch_all(pool)
        .await?;
    for r in rows {
        let status: String = r.get("status");
        trading
            .ledger
            .restore_account(Account {
                account_id: r.get("account_id"),
                user_id: r.get("user_id"),
                status: AccountStatus::parse(&status).unwrap_or(AccountStatus::Active),
                cash_balance: r.get("cash_balance"),
                withdrawable_balance: r.get("withdrawable_balance"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .await;
        accounts += 1;
    }

    let mut holdings = 0usize;
    let rows = sqlx::query("SELECT hold_id, account_id, ticker, quantity, avg_cost, created_at, updated_at FROM holding")
        .fetch_all(pool)
        .await?;
    for r in rows {
        trading
            .ledger
            .restore_holding(Holding {
                hold_id: r.get("hold_id"),
                account_id: r.get("account_id"),
                ticker: r.get("ticker"),
                quantity: r.get("quantity"),
                avg_cost: r.get("avg_cost"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .await;
        holdings += 1;
    }

    let mut orders = 0usize;
    for (table, side) in [("stock_buy", Side::Buy), ("stock_sell", Side::Sell)] {
        let sql = format!(
            "SELECT order_id, account_id, ticker, holding_id, price, quantity, status, created_at, updated_at FROM {table}"
        );
        let rows = sqlx::query(&sql).fetch_all(pool).await?;
        for r in rows {
            let status: String = r.get("status");
            trading
                .orders
                .restore(Order {
                    order_id: r.get("order_id"),
                    side,
                    account_id: r.get("account_id"),
                    ticker: r.get("ticker"),
                    holding_id: r.get("holding_id"),
                    price: r.get("price"),
                    quantity: r.get("quantity"),
                    status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Failed),
                    created_at: r.get("created_at"),
                    updated_at: r.get("updated_at"),
                })
                .await;
            orders += 1;
        }
    }

    info!(accounts, holdings, orders, "replayed journal tables");
    Ok(())
}

/// PENDING orders left over from a previous process still need execution
/// attempts; re-publish them after replay, the at-least-once redelivery
/// path. Terminal orders are left alone.
pub async fn republish_pending(trading: &Trading) -> usize {
    let pending = trading.orders.list_by_status(OrderStatus::Pending).await;
    let now: DateTime<Utc> = trading.clock.now_utc();
    let mut published = 0usize;
    for order in &pending {
        let retry_count = trading
            .cache
            .get_retry_record(&order.order_id)
            .map(|r| r.retry_count)
            .unwrap_or(0);
        trading.bus.publish_active(crate::bus::OrderMessage {
            order_id: order.order_id.clone(),
            side: order.side,
            retry_count,
            enqueued_at: now,
            not_before: None,
        });
        published += 1;
    }
    published
}
