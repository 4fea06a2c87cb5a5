use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::TradeError;
use crate::store::{JournalEvent, JournalTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Inactive => "INACTIVE",
            AccountStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(AccountStatus::Active),
            "INACTIVE" => Some(AccountStatus::Inactive),
            "SUSPENDED" => Some(AccountStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub user_id: String,
    pub status: AccountStatus,
    pub cash_balance: i64,
    pub withdrawable_balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryType {
    BuyStock,
    SellStock,
    BuyProduct,
    Refund,
    ReserveAdjust,
}

impl HistoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryType::BuyStock => "BUY_STOCK",
            HistoryType::SellStock => "SELL_STOCK",
            HistoryType::BuyProduct => "BUY_PRODUCT",
            HistoryType::Refund => "REFUND",
            HistoryType::ReserveAdjust => "RESERVE_ADJUST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY_STOCK" => Some(HistoryType::BuyStock),
            "SELL_STOCK" => Some(HistoryType::SellStock),
            "BUY_PRODUCT" => Some(HistoryType::BuyProduct),
            "REFUND" => Some(HistoryType::Refund),
            "RESERVE_ADJUST" => Some(HistoryType::ReserveAdjust),
            _ => None,
        }
    }
}

/// Append-only record of one cash mutation. `balance_after` always equals
/// `balance_before + amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountHistory {
    pub history_id: String,
    pub account_id: String,
    pub kind: HistoryType,
    pub related_order_id: Option<String>,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub hold_id: String,
    pub account_id: String,
    pub ticker: String,
    pub quantity: i64,
    pub avg_cost: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, Account>,
    account_by_user: HashMap<String, String>,
    // key: (account_id, ticker)
    holdings: HashMap<(String, String), Holding>,
    holding_ids: HashMap<String, (String, String)>,
    history: HashMap<String, Vec<AccountHistory>>,
}

/// Sole writer of cash balances and holding quantities. Every mutation runs
/// inside one write-lock section that also appends the history row and
/// emits the journal event, so readers never observe a balance without its
/// history entry.
pub struct Ledger {
    state: RwLock<LedgerState>,
    clock: Arc<dyn Clock>,
    journal: JournalTx,
    initial_cash: i64,
}

impl Ledger {
    pub fn new(initial_cash: i64, clock: Arc<dyn Clock>, journal: JournalTx) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            clock,
            journal,
            initial_cash,
        }
    }

    /// Idempotent per user: a second call returns the existing account.
    pub async fn create_account(&self, user_id: &str) -> Account {
        let mut state = self.state.write().await;
        if let Some(id) = state.account_by_user.get(user_id) {
            if let Some(existing) = state.accounts.get(id) {
                return existing.clone();
            }
        }
        let now = self.clock.now_utc();
        let account = Account {
            account_id: format!("ACC-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            status: AccountStatus::Active,
            cash_balance: self.initial_cash,
            withdrawable_balance: self.initial_cash,
            created_at: now,
            updated_at: now,
        };
        state
            .account_by_user
            .insert(user_id.to_string(), account.account_id.clone());
        state
            .accounts
            .insert(account.account_id.clone(), account.clone());
        let _ = self.journal.send(JournalEvent::AccountUpserted(account.clone()));
        account
    }

    pub async fn account(&self, account_id: &str) -> Result<Account, TradeError> {
        let state = self.state.read().await;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| TradeError::NotFound(format!("account {account_id}")))
    }

    pub async fn account_for_user(&self, user_id: &str) -> Option<Account> {
        let state = self.state.read().await;
        let id = state.account_by_user.get(user_id)?;
        state.accounts.get(id).cloned()
    }

    pub async fn balance(&self, account_id: &str) -> Result<i64, TradeError> {
        Ok(self.account(account_id).await?.cash_balance)
    }

    pub async fn can_reserve(&self, account_id: &str, amount: i64) -> bool {
        if amount < 0 {
            return false;
        }
        let state = self.state.read().await;
        state
            .accounts
            .get(account_id)
            .map(|a| a.cash_balance >= amount)
            .unwrap_or(false)
    }

    /// Debit the buy reservation at admission. Writes the BUY_STOCK row.
    pub async fn reserve_cash(
        &self,
        account_id: &str,
        amount: i64,
        order_id: &str,
    ) -> Result<(), TradeError> {
        self.mutate_cash(account_id, -amount, HistoryType::BuyStock, Some(order_id))
            .await
    }

    /// Return a reservation to the account (cancellation, failed fill).
    pub async fn release_cash(
        &self,
        account_id: &str,
        amount: i64,
        order_id: &str,
    ) -> Result<(), TradeError> {
        self.mutate_cash(account_id, amount, HistoryType::Refund, Some(order_id))
            .await
    }

    /// Credit sale proceeds on a sell fill.
    pub async fn credit_cash(
        &self,
        account_id: &str,
        amount: i64,
        order_id: &str,
    ) -> Result<(), TradeError> {
        self.mutate_cash(account_id, amount, HistoryType::SellStock, Some(order_id))
            .await
    }

    /// Re-anchor adjustment at market open: positive `delta` debits the
    /// extra reservation, negative refunds the excess.
    pub async fn adjust_reservation(
        &self,
        account_id: &str,
        delta: i64,
        order_id: &str,
    ) -> Result<(), TradeError> {
        self.mutate_cash(account_id, -delta, HistoryType::ReserveAdjust, Some(order_id))
            .await
    }

    async fn mutate_cash(
        &self,
        account_id: &str,
        amount: i64,
        kind: HistoryType,
        order_id: Option<&str>,
    ) -> Result<(), TradeError> {
        let mut state = self.state.write().await;
        let now = self.clock.now_utc();
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| TradeError::NotFound(format!("account {account_id}")))?;
        let before = account.cash_balance;
        let after = before + amount;
        if after < 0 {
            return Err(TradeError::InsufficientFunds {
                required: -amount,
                available: before,
            });
        }
        account.cash_balance = after;
        account.withdrawable_balance = after;
        account.updated_at = now;
        let account_row = account.clone();

        let entry = AccountHistory {
            history_id: format!("HIST-{}", Uuid::new_v4()),
            account_id: account_id.to_string(),
            kind,
            related_order_id: order_id.map(|s| s.to_string()),
            amount,
            balance_before: before,
            balance_after: after,
            at: now,
        };
        state
            .history
            .entry(account_id.to_string())
            .or_default()
            .push(entry.clone());

        let _ = self.journal.send(JournalEvent::AccountUpserted(account_row));
        let _ = self.journal.send(JournalEvent::HistoryAppended(entry));
        Ok(())
    }

    /// Upsert a holding on a buy fill. The new average cost is the
    /// quantity-weighted mean with integer truncation:
    /// `(Q*A + q*p) div (Q+q)`. No cash moves here; the reservation was
    /// debited at admission.
    pub async fn apply_buy_fill(
        &self,
        account_id: &str,
        ticker: &str,
        qty: i64,
        price: i64,
    ) -> Result<Holding, TradeError> {
        if qty <= 0 || price <= 0 {
            return Err(TradeError::Internal(format!(
                "buy fill with non-positive qty={qty} price={price}"
            )));
        }
        let mut state = self.state.write().await;
        let now = self.clock.now_utc();
        let key = (account_id.to_string(), ticker.to_string());
        let holding = match state.holdings.get_mut(&key) {
            Some(h) => {
                let total = h.quantity * h.avg_cost + qty * price;
                h.quantity += qty;
                h.avg_cost = total / h.quantity;
                h.updated_at = now;
                h.clone()
            }
            None => {
                let h = Holding {
                    hold_id: format!("HOLD-{}", Uuid::new_v4()),
                    account_id: account_id.to_string(),
                    ticker: ticker.to_string(),
                    quantity: qty,
                    avg_cost: price,
                    created_at: now,
                    updated_at: now,
                };
                state.holding_ids.insert(h.hold_id.clone(), key.clone());
                state.holdings.insert(key, h.clone());
                h
            }
        };
        let _ = self.journal.send(JournalEvent::HoldingUpserted(holding.clone()));
        Ok(holding)
    }

    /// Reduce a holding on a sell fill; the row is deleted when it reaches
    /// zero. Selling past the held quantity is refused, never clamped.
    pub async fn apply_sell_fill(&self, hold_id: &str, qty: i64) -> Result<(), TradeError> {
        let mut state = self.state.write().await;
        let now = self.clock.now_utc();
        let key = state
            .holding_ids
            .get(hold_id)
            .cloned()
            .ok_or_else(|| TradeError::NotFound(format!("holding {hold_id}")))?;
        let holding = state
            .holdings
            .get_mut(&key)
            .ok_or_else(|| TradeError::NotFound(format!("holding {hold_id}")))?;
        if holding.quantity < qty {
            return Err(TradeError::InsufficientHolding {
                requested: qty,
                held: holding.quantity,
            });
        }
        holding.quantity -= qty;
        holding.updated_at = now;
        if holding.quantity == 0 {
            state.holdings.remove(&key);
            state.holding_ids.remove(hold_id);
            let _ = self.journal.send(JournalEvent::HoldingRemoved {
                hold_id: hold_id.to_string(),
            });
        } else {
            let row = holding.clone();
            let _ = self.journal.send(JournalEvent::HoldingUpserted(row));
        }
        Ok(())
    }

    pub async fn holding(&self, account_id: &str, ticker: &str) -> Option<Holding> {
        let state = self.state.read().await;
        state
            .holdings
            .get(&(account_id.to_string(), ticker.to_string()))
            .cloned()
    }

    pub async fn holding_by_id(&self, hold_id: &str) -> Option<Holding> {
        let state = self.state.read().await;
        let key = state.holding_ids.get(hold_id)?;
        state.holdings.get(key).cloned()
    }

    pub async fn holdings_for_account(&self, account_id: &str) -> Vec<Holding> {
        let state = self.state.read().await;
        state
            .holdings
            .values()
            .filter(|h| h.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn history(&self, account_id: &str) -> Vec<AccountHistory> {
        let state = self.state.read().await;
        state.history.get(account_id).cloned().unwrap_or_default()
    }

    /// Startup replay: install a persisted row without journaling it back.
    pub async fn restore_account(&self, account: Account) {
        let mut state = self.state.write().await;
        state
            .account_by_user
            .insert(account.user_id.clone(), account.account_id.clone());
        state.accounts.insert(account.account_id.clone(), account);
    }

    /// Startup replay counterpart for holdings.
    pub async fn restore_holding(&self, holding: Holding) {
        let mut state = self.state.write().await;
        let key = (holding.account_id.clone(), holding.ticker.clone());
        state.holding_ids.insert(holding.hold_id.clone(), key.clone());
        state.holdings.insert(key, holding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::mpsc;

    fn ledger() -> Ledger {
        let (tx, _rx) = mpsc::unbounded_channel();
        Ledger::new(1_000_000, ManualClock::at_kst(2025, 6, 2, 10, 0, 0), tx)
    }

    #[tokio::test]
    async fn create_account_is_idempotent_per_user() {
        let ledger = ledger();
        let a = ledger.create_account("u1").await;
        let b = ledger.create_account("u1").await;
        assert_eq!(a.account_id, b.account_id);
        assert_eq!(a.cash_balance, 1_000_000);
    }

    #[tokio::test]
    async fn reserve_debits_and_appends_buy_stock_row() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        ledger.reserve_cash(&acc.account_id, 70_000, "BUY-1").await.unwrap();
        assert_eq!(ledger.balance(&acc.account_id).await.unwrap(), 930_000);

        let history = ledger.history(&acc.account_id).await;
        assert_eq!(history.len(), 1);
        let row = &history[0];
        assert_eq!(row.kind, HistoryType::BuyStock);
        assert_eq!(row.amount, -70_000);
        assert_eq!(row.balance_before, 1_000_000);
        assert_eq!(row.balance_after, 930_000);
        assert_eq!(row.related_order_id.as_deref(), Some("BUY-1"));
    }

    #[tokio::test]
    async fn reserve_fails_without_funds_and_leaves_no_trace() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        ledger.reserve_cash(&acc.account_id, 999_000, "BUY-1").await.unwrap();
        let err = ledger.reserve_cash(&acc.account_id, 2_000, "BUY-2").await.unwrap_err();
        assert!(matches!(err, TradeError::InsufficientFunds { required: 2_000, available: 1_000 }));
        assert_eq!(ledger.balance(&acc.account_id).await.unwrap(), 1_000);
        assert_eq!(ledger.history(&acc.account_id).await.len(), 1);
    }

    #[tokio::test]
    async fn release_and_credit_append_matching_rows() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        ledger.reserve_cash(&acc.account_id, 70_000, "BUY-1").await.unwrap();
        ledger.release_cash(&acc.account_id, 70_000, "BUY-1").await.unwrap();
        ledger.credit_cash(&acc.account_id, 400_000, "SELL-1").await.unwrap();
        assert_eq!(ledger.balance(&acc.account_id).await.unwrap(), 1_400_000);

        let history = ledger.history(&acc.account_id).await;
        let kinds: Vec<HistoryType> = history.iter().map(|h| h.kind).collect();
        assert_eq!(
            kinds,
            vec![HistoryType::BuyStock, HistoryType::Refund, HistoryType::SellStock]
        );
        // Rows chain: each balance_before equals the prior balance_after.
        for pair in history.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
    }

    #[tokio::test]
    async fn buy_fill_recomputes_truncated_avg_cost() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        let h1 = ledger.apply_buy_fill(&acc.account_id, "005930", 3, 70_000).await.unwrap();
        assert_eq!(h1.quantity, 3);
        assert_eq!(h1.avg_cost, 70_000);

        let h2 = ledger.apply_buy_fill(&acc.account_id, "005930", 2, 70_001).await.unwrap();
        assert_eq!(h2.quantity, 5);
        // (3*70000 + 2*70001) / 5 = 350002 / 5 = 70000 (truncated)
        assert_eq!(h2.avg_cost, 70_000);
        assert_eq!(h2.hold_id, h1.hold_id);
    }

    #[tokio::test]
    async fn sell_fill_reduces_then_deletes_and_keeps_avg() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        let h = ledger.apply_buy_fill(&acc.account_id, "035420", 3, 180_000).await.unwrap();

        ledger.apply_sell_fill(&h.hold_id, 2).await.unwrap();
        let remaining = ledger.holding(&acc.account_id, "035420").await.unwrap();
        assert_eq!(remaining.quantity, 1);
        assert_eq!(remaining.avg_cost, 180_000);

        ledger.apply_sell_fill(&h.hold_id, 1).await.unwrap();
        assert!(ledger.holding(&acc.account_id, "035420").await.is_none());
        assert!(ledger.holding_by_id(&h.hold_id).await.is_none());
    }

    #[tokio::test]
    async fn oversell_is_refused() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        let h = ledger.apply_buy_fill(&acc.account_id, "035420", 2, 180_000).await.unwrap();
        let err = ledger.apply_sell_fill(&h.hold_id, 3).await.unwrap_err();
        assert!(matches!(err, TradeError::InsufficientHolding { requested: 3, held: 2 }));
        assert_eq!(ledger.holding(&acc.account_id, "035420").await.unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn adjust_reservation_moves_cash_both_ways() {
        let ledger = ledger();
        let acc = ledger.create_account("u1").await;
        ledger.adjust_reservation(&acc.account_id, 20_000, "BUY-1").await.unwrap();
        assert_eq!(ledger.balance(&acc.account_id).await.unwrap(), 980_000);
        ledger.adjust_reservation(&acc.account_id, -5_000, "BUY-1").await.unwrap();
        assert_eq!(ledger.balance(&acc.account_id).await.unwrap(), 985_000);

        let history = ledger.history(&acc.account_id).await;
        assert!(history.iter().all(|h| h.kind == HistoryType::ReserveAdjust));
        assert_eq!(history[0].amount, -20_000);
        assert_eq!(history[1].amount, 5_000);
    }

    #[tokio::test]
    async fn balance_of_unknown_account_is_not_found() {
        let ledger = ledger();
        assert!(matches!(
            ledger.balance("ACC-missing").await.unwrap_err(),
            TradeError::NotFound(_)
        ));
        assert!(!ledger.can_reserve("ACC-missing", 1).await);
    }
}
