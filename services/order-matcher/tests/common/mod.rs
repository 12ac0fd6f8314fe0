//! Common test utilities and fixtures

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use order_matcher::config::MatcherConfig;
use order_matcher::market_hours::MarketHoursOracle;
use order_matcher::persistence::{FillCommit, FillOutcome, InMemoryOrderStore, OrderStore};
use order_matcher::waiting_index::{InMemoryWaitingIndex, WaitingOrderIndex};
use order_matcher::{
    Execution, MatchError, MatchResult, MatchingService, Order, OrderId, OrderRequest, Side,
};

/// Default ticker used across tests
pub const TICKER: &str = "005930";

/// Create a standard test configuration
pub fn create_test_config() -> MatcherConfig {
    let mut config = MatcherConfig::default();
    config.scheduler.tick_interval_ms = 20;
    config.scheduler.max_concurrent_tickers = 2;
    config
}

/// Create a limit order request
pub fn order_request(ticker: &str, side: Side, price: Decimal, amount: Decimal) -> OrderRequest {
    OrderRequest {
        ticker: ticker.to_string(),
        side,
        price,
        amount,
    }
}

/// Market-hours oracle that tests open and close by hand
#[derive(Debug)]
pub struct MarketSwitch {
    open: AtomicBool,
}

impl MarketSwitch {
    /// Start open
    pub fn open() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }

    /// Set the market state
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl MarketHoursOracle for MarketSwitch {
    fn is_market_open(&self, _now: DateTime<Utc>) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn index_down() -> MatchError {
    MatchError::IndexUnavailable("injected outage".to_string())
}

/// In-memory index that counts calls, can fail on demand and can hold
/// `list_tickers_with_activity` until released
#[derive(Debug, Default)]
pub struct InstrumentedIndex {
    inner: InMemoryWaitingIndex,
    calls: AtomicUsize,
    unavailable: AtomicBool,
    gated: AtomicBool,
    /// Signalled when a gated listing starts waiting
    pub entered: Notify,
    /// Releases a gated listing
    pub release: Notify,
}

impl InstrumentedIndex {
    /// Number of index operations performed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every operation fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Hold ticker listings until `release` is notified
    pub fn set_gated(&self, gated: bool) {
        self.gated.store(gated, Ordering::SeqCst);
    }

    fn enter(&self) -> MatchResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(index_down());
        }
        Ok(())
    }
}

#[async_trait]
impl WaitingOrderIndex for InstrumentedIndex {
    async fn enqueue(&self, side: Side, ticker: &str, order_id: OrderId, price: Decimal) -> MatchResult<()> {
        self.enter()?;
        self.inner.enqueue(side, ticker, order_id, price).await
    }

    async fn list_waiting_ids(&self, side: Side, ticker: &str) -> MatchResult<Vec<OrderId>> {
        self.enter()?;
        self.inner.list_waiting_ids(side, ticker).await
    }

    async fn remove(&self, side: Side, ticker: &str, order_id: OrderId) -> MatchResult<bool> {
        self.enter()?;
        self.inner.remove(side, ticker, order_id).await
    }

    async fn list_tickers_with_activity(&self) -> MatchResult<Vec<String>> {
        self.enter()?;
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.list_tickers_with_activity().await
    }

    async fn len(&self, side: Side, ticker: &str) -> MatchResult<usize> {
        self.inner.len(side, ticker).await
    }
}

/// In-memory store whose `load_order` fails for chosen ids
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: InMemoryOrderStore,
    poisoned: Mutex<FxHashSet<OrderId>>,
}

impl FaultyStore {
    /// Make loading `order_id` fail
    pub fn poison(&self, order_id: OrderId) {
        self.poisoned.lock().insert(order_id);
    }

    /// Every execution written so far
    pub fn all_executions(&self) -> Vec<Execution> {
        self.inner.all_executions()
    }
}

#[async_trait]
impl OrderStore for FaultyStore {
    async fn insert_order(&self, request: OrderRequest, created_at: DateTime<Utc>) -> MatchResult<Order> {
        self.inner.insert_order(request, created_at).await
    }

    async fn load_order(&self, order_id: OrderId) -> MatchResult<Option<Order>> {
        if self.poisoned.lock().contains(&order_id) {
            return Err(MatchError::Store(sqlx::Error::PoolTimedOut));
        }
        self.inner.load_order(order_id).await
    }

    async fn load_orders(&self, order_ids: &[OrderId]) -> MatchResult<Vec<Order>> {
        self.inner.load_orders(order_ids).await
    }

    async fn commit_fill(&self, fill: &FillCommit) -> MatchResult<FillOutcome> {
        self.inner.commit_fill(fill).await
    }

    async fn cancel_order(&self, order_id: OrderId, at: DateTime<Utc>) -> MatchResult<Option<Order>> {
        self.inner.cancel_order(order_id, at).await
    }

    async fn executions_for(&self, order_id: OrderId) -> MatchResult<Vec<Execution>> {
        self.inner.executions_for(order_id).await
    }

    async fn load_live_orders(&self) -> MatchResult<Vec<Order>> {
        self.inner.load_live_orders().await
    }
}

/// Service wired to instrumented backends
pub struct TestExchange {
    /// Service under test
    pub service: MatchingService,
    /// Store handle
    pub store: Arc<FaultyStore>,
    /// Index handle
    pub index: Arc<InstrumentedIndex>,
    /// Market-hours switch
    pub market: Arc<MarketSwitch>,
}

impl TestExchange {
    /// Build with the default test configuration
    pub fn new() -> Self {
        Self::with_config(&create_test_config())
    }

    /// Build with `config`
    pub fn with_config(config: &MatcherConfig) -> Self {
        let store = Arc::new(FaultyStore::default());
        let index = Arc::new(InstrumentedIndex::default());
        let market = Arc::new(MarketSwitch::open());
        let service =
            MatchingService::with_components(config, store.clone(), index.clone(), market.clone())
                .expect("test config is valid");
        Self {
            service,
            store,
            index,
            market,
        }
    }

    /// Submit a buy order on `ticker`
    pub async fn buy(&self, ticker: &str, price: Decimal, amount: Decimal) -> Order {
        self.service
            .submit_order(order_request(ticker, Side::Buy, price, amount))
            .await
            .expect("buy accepted")
    }

    /// Submit a sell order on `ticker`
    pub async fn sell(&self, ticker: &str, price: Decimal, amount: Decimal) -> Order {
        self.service
            .submit_order(order_request(ticker, Side::Sell, price, amount))
            .await
            .expect("sell accepted")
    }

    /// Current state of an order
    pub async fn order(&self, order_id: OrderId) -> Order {
        self.service.get_order(order_id).await.expect("order exists")
    }

    /// Waiting ids for (side, ticker)
    pub async fn waiting(&self, side: Side, ticker: &str) -> Vec<OrderId> {
        self.index
            .list_waiting_ids(side, ticker)
            .await
            .expect("index available")
    }
}

impl Default for TestExchange {
    fn default() -> Self {
        Self::new()
    }
}
