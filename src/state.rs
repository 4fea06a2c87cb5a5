use std::sync::Arc;

use sqlx::{Pool, Postgres};

use crate::bus::{BusReceivers, ExecutionBus};
use crate::cache::PriceCache;
use crate::clock::{Clock, MarketCalendar};
use crate::config::{AppConfig, TradingConfig};
use crate::ledger::Ledger;
use crate::oracle::PriceOracle;
use crate::orders::OrderStore;
use crate::stocks::StockCatalog;
use crate::store::JournalTx;

/// The trading core: every component of the order-execution pipeline plus
/// the collaborators they share. Handlers, workers and scheduled jobs all
/// hang off one `Arc<Trading>`.
pub struct Trading {
    pub cfg: TradingConfig,
    pub clock: Arc<dyn Clock>,
    pub calendar: MarketCalendar,
    pub cache: Arc<PriceCache>,
    pub oracle: PriceOracle,
    pub ledger: Ledger,
    pub orders: OrderStore,
    pub stocks: StockCatalog,
    pub bus: ExecutionBus,
    pub journal: JournalTx,
}

impl Trading {
    /// Wire the core. The caller owns the returned receivers and decides
    /// how many consumer loops to spawn (tests often consume inline).
    pub fn new(
        cfg: TradingConfig,
        clock: Arc<dyn Clock>,
        journal: JournalTx,
    ) -> (Arc<Self>, BusReceivers) {
        let calendar = MarketCalendar::new(&cfg);
        let cache = Arc::new(PriceCache::new(&cfg, clock.clone()));
        let oracle = PriceOracle::new(&cfg, clock.clone(), cache.clone());
        let ledger = Ledger::new(cfg.initial_cash, clock.clone(), journal.clone());
        let orders = OrderStore::new(clock.clone(), journal.clone());
        let (bus, receivers) = ExecutionBus::new(cfg.active_workers);
        let trading = Arc::new(Self {
            cfg,
            clock,
            calendar,
            cache,
            oracle,
            ledger,
            orders,
            stocks: StockCatalog::with_seed(),
            bus,
            journal,
        });
        (trading, receivers)
    }

    pub fn is_market_open(&self) -> bool {
        self.calendar.is_open_at(self.clock.now_utc())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub db: Pool<Postgres>,
    pub trading: Arc<Trading>,
}
