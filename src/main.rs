use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stocksim::cache::{OrderBookSnapshot, PriceSnapshot};
use stocksim::clock::SystemClock;
use stocksim::config::{load_config, AppConfig};
use stocksim::error::{ApiError, TradeError};
use stocksim::orders::Order;
use stocksim::state::{AppState, Trading};
use stocksim::store;
use stocksim::{feed, retry, tasks, worker};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest {
    user_id: String,
    ticker: String,
    qty: i64,
    price: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderAccepted {
    order_id: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryStatus {
    retry_count: u32,
    max_retry_count: u32,
    next_retry_time: Option<DateTime<Utc>>,
    max_retry_reached: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderDetail {
    order_id: String,
    side: &'static str,
    account_id: String,
    ticker: String,
    price: i64,
    quantity: i64,
    status: &'static str,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    retry: RetryStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    user_id: String,
    account_id: String,
    balance: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PriceInfo {
    ticker: String,
    name: String,
    sector: String,
    last_price: i64,
    is_market_open: bool,
    snapshot: Option<PriceSnapshot>,
    orderbook: Option<OrderBookSnapshot>,
}

/// Caller-bounded admission deadline.
const ADMISSION_DEADLINE_SECS: u64 = 5;

async fn submit_buy(
    State(state): State<AppState>,
    Json(req): Json<OrderRequest>,
) -> Result<(StatusCode, Json<OrderAccepted>), ApiError> {
    let order = submit_with_retry(&state.trading, &req, true).await?;
    Ok((StatusCode::OK, Json(accepted(&order))))
}

async fn submit_sell(
    State(state): State<AppState>,
    Json(req): Json<OrderRequest>,
) -> Result<(StatusCode, Json<OrderAccepted>), ApiError> {
    let order = submit_with_retry(&state.trading, &req, false).await?;
    Ok((StatusCode::OK, Json(accepted(&order))))
}

/// Conflict/Unavailable get one internal retry before surfacing (the
/// admission path is otherwise effect-free on error, so a repeat is safe).
/// The whole attempt runs under the admission deadline.
async fn submit_with_retry(
    trading: &Trading,
    req: &OrderRequest,
    buy: bool,
) -> Result<Order, TradeError> {
    let deadline = std::time::Duration::from_secs(ADMISSION_DEADLINE_SECS);
    let attempt_all = async {
        let mut retried = false;
        loop {
            let result = if buy {
                trading.submit_buy(&req.user_id, &req.ticker, req.qty, req.price).await
            } else {
                trading.submit_sell(&req.user_id, &req.ticker, req.qty, req.price).await
            };
            match result {
                Ok(order) => return Ok(order),
                Err(e) if e.is_retryable() && !retried => {
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    };
    match tokio::time::timeout(deadline, attempt_all).await {
        Ok(result) => result,
        Err(_) => Err(TradeError::Unavailable("admission deadline exceeded".to_string())),
    }
}

fn accepted(order: &Order) -> OrderAccepted {
    OrderAccepted {
        order_id: order.order_id.clone(),
        status: order.status.as_str(),
    }
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderDetail>, ApiError> {
    let trading = &state.trading;
    let order = trading
        .orders
        .get(&order_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Order not found"))?;

    let max = trading.cfg.max_retry_count;
    let retry = match trading.cache.get_retry_record(&order_id) {
        Some(rec) => RetryStatus {
            retry_count: rec.retry_count,
            max_retry_count: max,
            next_retry_time: Some(rec.next_eligible_at),
            max_retry_reached: rec.retry_count >= max,
        },
        None => RetryStatus {
            retry_count: 0,
            max_retry_count: max,
            next_retry_time: None,
            max_retry_reached: false,
        },
    };

    Ok(Json(OrderDetail {
        order_id: order.order_id,
        side: order.side.as_str(),
        account_id: order.account_id,
        ticker: order.ticker,
        price: order.price,
        quantity: order.quantity,
        status: order.status.as_str(),
        created_at: order.created_at,
        updated_at: order.updated_at,
        retry,
    }))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state
        .trading
        .ledger
        .account_for_user(&user_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Account not found"))?;
    Ok(Json(BalanceResponse {
        user_id,
        account_id: account.account_id,
        balance: account.cash_balance,
    }))
}

async fn get_price(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<PriceInfo>, ApiError> {
    let trading = &state.trading;
    let ticker = stocksim::stocks::normalize_ticker(&ticker).map_err(ApiError::from)?;
    let stock = trading
        .stocks
        .get(&ticker)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Stock not found"))?;

    Ok(Json(PriceInfo {
        last_price: trading.oracle.current_price(&ticker),
        is_market_open: trading.is_market_open(),
        snapshot: trading.cache.get_price(&ticker),
        orderbook: trading.cache.get_book(&ticker),
        ticker: stock.ticker,
        name: stock.name,
        sector: stock.sector,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HoldingRow {
    ticker: String,
    name: String,
    quantity: i64,
    avg_cost: i64,
    current_price: i64,
    market_value: i64,
    unrealized_pnl: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummary {
    user_id: String,
    account_id: String,
    status: &'static str,
    cash_balance: i64,
    withdrawable_balance: i64,
    holdings_value: i64,
    total_value: i64,
    holdings: Vec<HoldingRow>,
    created_at: DateTime<Utc>,
}

async fn get_account_summary(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<AccountSummary>, ApiError> {
    let trading = &state.trading;
    let account = trading
        .ledger
        .account_for_user(&user_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Account not found"))?;

    let mut rows = Vec::new();
    let mut holdings_value = 0i64;
    for h in trading.ledger.holdings_for_account(&account.account_id).await {
        let current_price = trading.oracle.current_price(&h.ticker);
        let market_value = current_price * h.quantity;
        holdings_value += market_value;
        rows.push(HoldingRow {
            name: trading
                .stocks
                .get(&h.ticker)
                .map(|s| s.name)
                .unwrap_or_else(|| h.ticker.clone()),
            ticker: h.ticker,
            quantity: h.quantity,
            avg_cost: h.avg_cost,
            current_price,
            market_value,
            unrealized_pnl: market_value - h.avg_cost * h.quantity,
        });
    }
    rows.sort_by(|a, b| a.ticker.cmp(&b.ticker));

    Ok(Json(AccountSummary {
        user_id,
        account_id: account.account_id,
        status: account.status.as_str(),
        cash_balance: account.cash_balance,
        withdrawable_balance: account.withdrawable_balance,
        holdings_value,
        total_value: account.cash_balance + holdings_value,
        holdings: rows,
        created_at: account.created_at,
    }))
}

async fn get_account_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trading = &state.trading;
    let account = trading
        .ledger
        .account_for_user(&user_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Account not found"))?;
    let history = trading.ledger.history(&account.account_id).await;
    Ok(Json(serde_json::json!({
        "userId": user_id,
        "accountId": account.account_id,
        "count": history.len(),
        "history": history,
    })))
}

async fn get_pending_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trading = &state.trading;
    let account = trading
        .ledger
        .account_for_user(&user_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Account not found"))?;
    let mut open: Vec<Order> = trading.orders.list_by_account(&account.account_id).await;
    open.retain(|o| !o.status.is_terminal());
    open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(Json(serde_json::json!({
        "userId": user_id,
        "count": open.len(),
        "orders": open,
    })))
}

async fn list_stocks(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut stocks = state.trading.stocks.all();
    stocks.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    Json(serde_json::json!({ "count": stocks.len(), "stocks": stocks }))
}

/// Feed health: how much of the live snapshot set is inside the oracle's
/// freshness window.
async fn get_data_quality(State(state): State<AppState>) -> Json<serde_json::Value> {
    let trading = &state.trading;
    let tickers = trading.cache.list_active_tickers();
    let total = tickers.len();
    let fresh = tickers
        .iter()
        .filter_map(|t| trading.cache.get_price(t))
        .filter(|snap| trading.oracle.is_fresh(snap))
        .count();

    let fresh_ratio = if total > 0 { fresh as f64 / total as f64 * 100.0 } else { 0.0 };
    let status = if total == 0 {
        "NO_DATA"
    } else if fresh_ratio >= 80.0 {
        "EXCELLENT"
    } else if fresh_ratio >= 60.0 {
        "GOOD"
    } else if fresh_ratio >= 40.0 {
        "FAIR"
    } else if fresh_ratio >= 20.0 {
        "POOR"
    } else {
        "CRITICAL"
    };

    Json(serde_json::json!({
        "status": status,
        "totalStocks": total,
        "freshData": fresh,
        "staleData": total - fresh,
        "freshRatio": format!("{fresh_ratio:.1}%"),
        "marketOpen": trading.is_market_open(),
        "cache": trading.cache.stats(),
    }))
}

async fn get_market_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let trading = &state.trading;
    let now = trading.clock.now_utc();
    let is_open = trading.calendar.is_open_at(now);
    let next_open = trading.calendar.next_open(now);

    let mut body = serde_json::json!({
        "isOpen": is_open,
        "currentTime": now,
        "nextOpen": next_open,
        "dataStats": {
            "liveSnapshots": trading.cache.live_snapshot_count(),
            "activeTickers": trading.cache.list_active_tickers(),
        }
    });
    if is_open {
        if let Some(close_at) = trading.calendar.close_at(now) {
            body["status"] = serde_json::json!("OPEN");
            body["minutesToClose"] = serde_json::json!((close_at - now).num_minutes());
        }
    } else {
        body["status"] = serde_json::json!("CLOSED");
        body["minutesToOpen"] = serde_json::json!((next_open - now).num_minutes());
    }
    Json(body)
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("db error: {e}")))?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "database": "connected",
        "marketOpen": state.trading.is_market_open(),
    })))
}

fn build_router(state: AppState) -> Router {
    let cors = build_cors(&state.cfg);
    Router::new()
        .route("/orders/buy", post(submit_buy))
        .route("/orders/sell", post(submit_sell))
        .route("/orders/:order_id", get(get_order))
        .route("/accounts/:user_id/balance", get(get_balance))
        .route("/accounts/:user_id/summary", get(get_account_summary))
        .route("/accounts/:user_id/history", get(get_account_history))
        .route("/accounts/:user_id/orders/pending", get(get_pending_orders))
        .route("/stocks", get(list_stocks))
        .route("/prices/:ticker", get(get_price))
        .route("/market/status", get(get_market_status))
        .route("/market/quality", get(get_data_quality))
        .route("/health", get(health_check))
        .layer(cors)
        .with_state(state)
}

fn build_cors(cfg: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]).allow_headers(Any);
    if cfg.api.cors_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config()?;
    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .max_lifetime(std::time::Duration::from_secs(cfg.database.max_lifetime_seconds))
        .acquire_timeout(std::time::Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .connect(&cfg.database.url)
        .await
        .context("database connection failed")?;

    let (journal_tx, journal_rx) = store::journal_channel();
    let (trading, receivers) = Trading::new(cfg.trading.clone(), Arc::new(SystemClock), journal_tx);

    // Rebuild in-memory state before accepting traffic, then put leftover
    // PENDING orders back on the bus.
    store::replay_from_db(&db, &trading).await.context("journal replay failed")?;
    let republished = store::republish_pending(&trading).await;
    info!(republished, "startup replay complete");

    tokio::spawn(store::run_journal_writer(db.clone(), journal_rx));
    for (partition, rx) in receivers.active.into_iter().enumerate() {
        tokio::spawn(worker::run_active_worker(trading.clone(), rx, partition));
    }
    tokio::spawn(retry::run_retry_worker(trading.clone(), receivers.retry));
    if cfg.trading.mock_feed {
        feed::refresh_subscriptions(&trading);
        tokio::spawn(feed::run_mock_feed(trading.clone()));
    }
    tasks::start_scheduled_jobs(trading.clone());

    let state = AppState { cfg: Arc::new(cfg.clone()), db, trading };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port)
        .parse()
        .context("invalid API bind address")?;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
