use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::TradeError;
use crate::store::{JournalEvent, JournalTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Shared buy/sell lifecycle. PENDING orders are live on the bus; RESERVED
/// orders wait for market open; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Reserved,
    Executed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Executed | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Reserved => "RESERVED",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "RESERVED" => Some(OrderStatus::Reserved),
            "EXECUTED" => Some(OrderStatus::Executed),
            "FAILED" => Some(OrderStatus::Failed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub side: Side,
    pub account_id: String,
    pub ticker: String,
    /// Sell orders reference the holding they draw down.
    pub holding_id: Option<String>,
    pub price: i64,
    pub quantity: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn notional(&self) -> i64 {
        self.price * self.quantity
    }
}

#[derive(Default)]
struct OrderState {
    orders: HashMap<String, Order>,
    by_account: HashMap<String, Vec<String>>,
}

/// Persistent order rows with the status machine. Only admission inserts;
/// only the matching worker, reservation opener, and close-time cleanup
/// transition, always through the optimistic `transition*` methods.
pub struct OrderStore {
    state: RwLock<OrderState>,
    clock: Arc<dyn Clock>,
    journal: JournalTx,
}

impl OrderStore {
    pub fn new(clock: Arc<dyn Clock>, journal: JournalTx) -> Self {
        Self {
            state: RwLock::new(OrderState::default()),
            clock,
            journal,
        }
    }

    pub async fn insert(&self, order: Order) -> Result<(), TradeError> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.order_id) {
            return Err(TradeError::Conflict(format!(
                "order {} already exists",
                order.order_id
            )));
        }
        state
            .by_account
            .entry(order.account_id.clone())
            .or_default()
            .push(order.order_id.clone());
        let _ = self.journal.send(JournalEvent::OrderUpserted(order.clone()));
        state.orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    pub async fn get(&self, order_id: &str) -> Option<Order> {
        let state = self.state.read().await;
        state.orders.get(order_id).cloned()
    }

    pub async fn list_by_account_status(
        &self,
        account_id: &str,
        status: OrderStatus,
    ) -> Vec<Order> {
        let state = self.state.read().await;
        state
            .by_account
            .get(account_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.orders.get(id))
                    .filter(|o| o.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list_by_account(&self, account_id: &str) -> Vec<Order> {
        let state = self.state.read().await;
        state
            .by_account
            .get(account_id)
            .map(|ids| ids.iter().filter_map(|id| state.orders.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn list_by_status(&self, status: OrderStatus) -> Vec<Order> {
        let state = self.state.read().await;
        let mut out: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.order_id.cmp(&b.order_id)));
        out
    }

    /// Optimistic status transition: fails with `Conflict` unless the
    /// current status equals `expected`. Terminal states refuse re-entry.
    pub async fn transition(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order, TradeError> {
        self.transition_with(order_id, expected, next, |_| {}).await
    }

    /// Transition plus an extra mutation applied in the same write section
    /// (the opener updates the price together with the status).
    pub async fn transition_with(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
        mutate: impl FnOnce(&mut Order),
    ) -> Result<Order, TradeError> {
        let mut state = self.state.write().await;
        let now = self.clock.now_utc();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| TradeError::NotFound(format!("order {order_id}")))?;
        if order.status != expected {
            return Err(TradeError::Conflict(format!(
                "order {order_id} is {}, expected {}",
                order.status.as_str(),
                expected.as_str()
            )));
        }
        if order.status.is_terminal() {
            return Err(TradeError::Conflict(format!(
                "order {order_id} is terminal ({})",
                order.status.as_str()
            )));
        }
        order.status = next;
        order.updated_at = now;
        mutate(order);
        let row = order.clone();
        let _ = self.journal.send(JournalEvent::OrderUpserted(row.clone()));
        Ok(row)
    }

    /// The fill-exception edge. The worker claims an order EXECUTED before
    /// settling the ledger; when settlement then fails, the claim is
    /// demoted to FAILED here. This is the only path out of a terminal
    /// status and it accepts nothing but EXECUTED.
    pub async fn fail_execution(&self, order_id: &str) -> Result<Order, TradeError> {
        let mut state = self.state.write().await;
        let now = self.clock.now_utc();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| TradeError::NotFound(format!("order {order_id}")))?;
        if order.status != OrderStatus::Executed {
            return Err(TradeError::Conflict(format!(
                "order {order_id} is {}, expected EXECUTED",
                order.status.as_str()
            )));
        }
        order.status = OrderStatus::Failed;
        order.updated_at = now;
        let row = order.clone();
        let _ = self.journal.send(JournalEvent::OrderUpserted(row.clone()));
        Ok(row)
    }

    /// Quantity already committed to open sell orders against a holding.
    /// Admission subtracts this from the held quantity so concurrent sells
    /// cannot oversell before any of them fills.
    pub async fn open_sell_quantity(&self, holding_id: &str) -> i64 {
        let state = self.state.read().await;
        state
            .orders
            .values()
            .filter(|o| {
                o.side == Side::Sell
                    && o.holding_id.as_deref() == Some(holding_id)
                    && matches!(o.status, OrderStatus::Pending | OrderStatus::Reserved)
            })
            .map(|o| o.quantity)
            .sum()
    }

    /// Startup replay: install a persisted row without journaling it back.
    pub async fn restore(&self, order: Order) {
        let mut state = self.state.write().await;
        state
            .by_account
            .entry(order.account_id.clone())
            .or_default()
            .push(order.order_id.clone());
        state.orders.insert(order.order_id.clone(), order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::mpsc;

    fn store() -> OrderStore {
        let (tx, _rx) = mpsc::unbounded_channel();
        OrderStore::new(ManualClock::at_kst(2025, 6, 2, 10, 0, 0), tx)
    }

    fn order(id: &str, side: Side, status: OrderStatus) -> Order {
        Order {
            order_id: id.to_string(),
            side,
            account_id: "ACC-1".to_string(),
            ticker: "005930".to_string(),
            holding_id: (side == Side::Sell).then(|| "HOLD-1".to_string()),
            price: 70_000,
            quantity: 1,
            status,
            created_at: kst_now(),
            updated_at: kst_now(),
        }
    }

    fn kst_now() -> DateTime<Utc> {
        crate::clock::kst_datetime(2025, 6, 2, 10, 0, 0)
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let store = store();
        store.insert(order("BUY-1", Side::Buy, OrderStatus::Pending)).await.unwrap();
        let got = store.get("BUY-1").await.unwrap();
        assert_eq!(got.status, OrderStatus::Pending);

        let pending = store
            .list_by_account_status("ACC-1", OrderStatus::Pending)
            .await;
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = store();
        store.insert(order("BUY-1", Side::Buy, OrderStatus::Pending)).await.unwrap();
        let err = store
            .insert(order("BUY-1", Side::Buy, OrderStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::Conflict(_)));
    }

    #[tokio::test]
    async fn optimistic_transition_guards_status() {
        let store = store();
        store.insert(order("BUY-1", Side::Buy, OrderStatus::Pending)).await.unwrap();

        store
            .transition("BUY-1", OrderStatus::Pending, OrderStatus::Executed)
            .await
            .unwrap();

        // A raced second transition observes the terminal state and fails.
        let err = store
            .transition("BUY-1", OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::Conflict(_)));
        assert_eq!(store.get("BUY-1").await.unwrap().status, OrderStatus::Executed);
    }

    #[tokio::test]
    async fn terminal_states_refuse_reentry() {
        let store = store();
        store.insert(order("BUY-1", Side::Buy, OrderStatus::Pending)).await.unwrap();
        store
            .transition("BUY-1", OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .unwrap();
        for next in [OrderStatus::Pending, OrderStatus::Executed, OrderStatus::Failed] {
            let err = store
                .transition("BUY-1", OrderStatus::Cancelled, next)
                .await
                .unwrap_err();
            assert!(matches!(err, TradeError::Conflict(_)) || matches!(err, TradeError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn transition_with_mutates_in_same_step() {
        let store = store();
        store.insert(order("BUY-1", Side::Buy, OrderStatus::Reserved)).await.unwrap();
        let updated = store
            .transition_with("BUY-1", OrderStatus::Reserved, OrderStatus::Pending, |o| {
                o.price = 71_000;
            })
            .await
            .unwrap();
        assert_eq!(updated.price, 71_000);
        assert_eq!(updated.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn open_sell_quantity_sums_live_orders_only() {
        let store = store();
        let mut s1 = order("SELL-1", Side::Sell, OrderStatus::Pending);
        s1.quantity = 2;
        let mut s2 = order("SELL-2", Side::Sell, OrderStatus::Reserved);
        s2.quantity = 3;
        let mut s3 = order("SELL-3", Side::Sell, OrderStatus::Executed);
        s3.quantity = 5;
        store.insert(s1).await.unwrap();
        store.insert(s2).await.unwrap();
        store.insert(s3).await.unwrap();

        assert_eq!(store.open_sell_quantity("HOLD-1").await, 5);
        assert_eq!(store.open_sell_quantity("HOLD-2").await, 0);
    }

    #[tokio::test]
    async fn list_by_status_orders_by_creation() {
        let store = store();
        let mut a = order("BUY-2", Side::Buy, OrderStatus::Reserved);
        a.created_at = kst_now() + chrono::Duration::seconds(1);
        store.insert(order("BUY-1", Side::Buy, OrderStatus::Reserved)).await.unwrap();
        store.insert(a).await.unwrap();

        let reserved = store.list_by_status(OrderStatus::Reserved).await;
        let ids: Vec<&str> = reserved.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["BUY-1", "BUY-2"]);
    }

    #[tokio::test]
    async fn cancelled_transition_vs_unknown_order() {
        let store = store();
        let err = store
            .transition("BUY-404", OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::NotFound(_)));
    }
}
