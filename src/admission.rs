use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::bus::OrderMessage;
use crate::error::TradeError;
use crate::ledger::Account;
use crate::orders::{Order, OrderStatus, Side};
use crate::state::Trading;
use crate::stocks;

/// Admission: validate, normalize, price, reserve, persist, enqueue.
/// Every error path leaves cash, holdings and the order store untouched.
impl Trading {
    /// Submit a buy order. Cash is debited here, at admission, not at fill.
    /// While the market is closed the order parks as RESERVED and is not
    /// published; the reservation opener promotes it at the next open.
    pub async fn submit_buy(
        &self,
        user_id: &str,
        ticker: &str,
        qty: i64,
        price: Option<i64>,
    ) -> Result<Order, TradeError> {
        let (user_id, ticker) = self.validate_request(user_id, ticker, qty, price)?;
        let price = match price {
            Some(p) => p,
            None => self.oracle.current_price(&ticker),
        };

        let account = self.account_for(&user_id).await;
        let amount = price * qty;
        let order_id = format!("BUY-{}", Uuid::new_v4());
        let market_open = self.is_market_open();

        self.ledger
            .reserve_cash(&account.account_id, amount, &order_id)
            .await?;

        let now = self.clock.now_utc();
        let order = self
            .persist_order(Order {
                order_id,
                side: Side::Buy,
                account_id: account.account_id.clone(),
                ticker,
                holding_id: None,
                price,
                quantity: qty,
                status: if market_open { OrderStatus::Pending } else { OrderStatus::Reserved },
                created_at: now,
                updated_at: now,
            })
            .await;

        // The insert can only collide on a duplicate UUID; unwind the
        // reservation so the error leaves no effects.
        let order = match order {
            Ok(o) => o,
            Err(e) => {
                let _ = self
                    .ledger
                    .release_cash(&account.account_id, amount, "admission-unwind")
                    .await;
                return Err(e);
            }
        };

        if market_open {
            self.publish_first_attempt(&order, now);
        }
        info!(
            order_id = %order.order_id,
            user_id = %account.user_id,
            ticker = %order.ticker,
            qty,
            price,
            status = order.status.as_str(),
            "buy order admitted"
        );
        Ok(order)
    }

    /// Submit a sell order. No cash moves at admission; instead the order
    /// must fit inside the holding net of quantity already committed to
    /// other open sells, so concurrent sells cannot oversell.
    pub async fn submit_sell(
        &self,
        user_id: &str,
        ticker: &str,
        qty: i64,
        price: Option<i64>,
    ) -> Result<Order, TradeError> {
        let (user_id, ticker) = self.validate_request(user_id, ticker, qty, price)?;
        let price = match price {
            Some(p) => p,
            None => self.oracle.current_price(&ticker),
        };

        let account = self
            .ledger
            .account_for_user(&user_id)
            .await
            .ok_or_else(|| TradeError::NotFound(format!("no account for user {user_id}")))?;
        let holding = self
            .ledger
            .holding(&account.account_id, &ticker)
            .await
            .ok_or_else(|| TradeError::InsufficientHolding { requested: qty, held: 0 })?;
        let committed = self.orders.open_sell_quantity(&holding.hold_id).await;
        let available = holding.quantity - committed;
        if available < qty {
            return Err(TradeError::InsufficientHolding { requested: qty, held: available.max(0) });
        }

        let market_open = self.is_market_open();
        let now = self.clock.now_utc();
        let order = self
            .persist_order(Order {
                order_id: format!("SELL-{}", Uuid::new_v4()),
                side: Side::Sell,
                account_id: account.account_id.clone(),
                ticker,
                holding_id: Some(holding.hold_id.clone()),
                price,
                quantity: qty,
                status: if market_open { OrderStatus::Pending } else { OrderStatus::Reserved },
                created_at: now,
                updated_at: now,
            })
            .await?;

        if market_open {
            self.publish_first_attempt(&order, now);
        }
        info!(
            order_id = %order.order_id,
            user_id = %account.user_id,
            ticker = %order.ticker,
            qty,
            price,
            status = order.status.as_str(),
            "sell order admitted"
        );
        Ok(order)
    }

    fn validate_request(
        &self,
        user_id: &str,
        ticker: &str,
        qty: i64,
        price: Option<i64>,
    ) -> Result<(String, String), TradeError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(TradeError::InvalidArgument("user id is required".to_string()));
        }
        let ticker = stocks::normalize_ticker(ticker)?;
        if !self.stocks.is_listed(&ticker) {
            return Err(TradeError::NotFound(format!("unknown ticker {ticker}")));
        }
        if qty < 1 || qty > self.cfg.max_order_qty {
            return Err(TradeError::InvalidArgument(format!(
                "quantity must be between 1 and {}",
                self.cfg.max_order_qty
            )));
        }
        if let Some(p) = price {
            if p < 1 || p > self.cfg.max_order_price {
                return Err(TradeError::InvalidArgument(format!(
                    "price must be between 1 and {}",
                    self.cfg.max_order_price
                )));
            }
        }
        Ok((user_id.to_string(), ticker))
    }

    async fn account_for(&self, user_id: &str) -> Account {
        // Buy admission auto-creates the account on first contact.
        self.ledger.create_account(user_id).await
    }

    async fn persist_order(&self, order: Order) -> Result<Order, TradeError> {
        self.orders.insert(order.clone()).await?;
        Ok(order)
    }

    pub(crate) fn publish_first_attempt(&self, order: &Order, now: DateTime<Utc>) {
        self.bus.publish_active(OrderMessage {
            order_id: order.order_id.clone(),
            side: order.side,
            retry_count: 0,
            enqueued_at: now,
            not_before: None,
        });
    }
}
