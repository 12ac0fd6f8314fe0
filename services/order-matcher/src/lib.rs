//! Order Matcher
//!
//! Continuous price-time priority matching of limit orders for a fixed
//! ticker universe, driven by a market-hours gated scheduler.
//!
//! Features:
//! - Waiting-order index per (side, ticker), ordered by limit price
//! - Atomic fill commits (executions and both orders in one unit)
//! - Buy-before-sell matching passes with per-order failure isolation
//! - Non-overlapping ticks with bounded per-ticker concurrency
//! - Index/store reconciliation on startup
//! - `PostgreSQL` or in-memory backends

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use chrono::Utc;
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod market_hours;
pub mod matching;
pub mod metrics;
pub mod notify;
pub mod order;
pub mod persistence;
pub mod recovery;
pub mod scheduler;
pub mod waiting_index;

pub use config::MatcherConfig;
pub use error::{MatchError, MatchResult};
pub use order::{Execution, FillEvent, Order, OrderId, OrderRequest, OrderStatus, Side};

use lifecycle::OrderLifecycleManager;
use market_hours::{MarketHoursOracle, TradingCalendar};
use matching::MatchExecutor;
use metrics::{MatcherMetrics, MatcherMetricsSnapshot};
use notify::BroadcastNotifier;
use persistence::{InMemoryOrderStore, OrderStore, PgOrderStore};
use recovery::{RecoveryManager, RecoveryStats};
use scheduler::{MatchingScheduler, TickOutcome};
use waiting_index::{InMemoryWaitingIndex, PgWaitingIndex, WaitingOrderIndex};

/// Order submission, cancellation and the matching loop behind one handle
#[derive(Debug)]
pub struct MatchingService {
    /// Order and execution store
    store: Arc<dyn OrderStore>,
    /// Waiting-order index
    index: Arc<dyn WaitingOrderIndex>,
    /// Lifecycle manager
    lifecycle: Arc<OrderLifecycleManager>,
    /// Fill event bus
    notifier: Arc<BroadcastNotifier>,
    /// Periodic matching driver
    scheduler: Arc<MatchingScheduler>,
    /// Metrics
    metrics: Arc<MatcherMetrics>,
    /// Scheduler stop signal
    shutdown_tx: watch::Sender<bool>,
    /// Running scheduler loop
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MatchingService {
    /// Create the service on the backends named by `config`: `PostgreSQL`
    /// when `database.url` is set, in-memory otherwise
    pub async fn new(config: MatcherConfig) -> MatchResult<Self> {
        config.validate()?;
        let Some(url) = config.database.url.clone() else {
            return Self::in_memory(config);
        };

        info!("Initializing order matcher on PostgreSQL");
        let db_pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
            .connect(&url)
            .await?;

        if config.database.run_migrations {
            persistence::run_migrations(&db_pool).await?;
        }

        let store = Arc::new(PgOrderStore::new(db_pool.clone()));
        let index = Arc::new(PgWaitingIndex::new(db_pool));
        let calendar = Arc::new(TradingCalendar::from_config(&config.market_hours)?);
        Self::with_components(&config, store, index, calendar)
    }

    /// Create the service on in-memory backends
    pub fn in_memory(config: MatcherConfig) -> MatchResult<Self> {
        config.validate()?;
        info!("Initializing order matcher in memory");

        let calendar = Arc::new(TradingCalendar::from_config(&config.market_hours)?);
        Self::with_components(
            &config,
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryWaitingIndex::new()),
            calendar,
        )
    }

    /// Assemble the service from explicit components
    pub fn with_components(
        config: &MatcherConfig,
        store: Arc<dyn OrderStore>,
        index: Arc<dyn WaitingOrderIndex>,
        market_hours: Arc<dyn MarketHoursOracle>,
    ) -> MatchResult<Self> {
        config.validate()?;

        let lifecycle = Arc::new(OrderLifecycleManager::new(config.matching.universe.clone()));
        let notifier = Arc::new(BroadcastNotifier::new(config.matching.event_capacity));
        let metrics = Arc::new(MatcherMetrics::new());

        let executor = Arc::new(MatchExecutor::new(
            store.clone(),
            index.clone(),
            notifier.clone(),
            lifecycle.clone(),
            metrics.clone(),
            config.matching.price_scale,
        ));
        let scheduler = Arc::new(MatchingScheduler::new(
            executor,
            index.clone(),
            market_hours,
            metrics.clone(),
            config.scheduler.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            store,
            index,
            lifecycle,
            notifier,
            scheduler,
            metrics,
            shutdown_tx,
            scheduler_handle: Mutex::new(None),
        })
    }

    /// Accept a new limit order and make it visible to matching
    pub async fn submit_order(&self, request: OrderRequest) -> MatchResult<Order> {
        self.lifecycle.validate_request(&request)?;

        let order = self.store.insert_order(request, Utc::now()).await?;

        if let Err(e) = self
            .index
            .enqueue(order.side, &order.ticker, order.id, order.price)
            .await
        {
            // Not indexed means never matched; withdraw it rather than leave it dangling
            error!(order_id = %order.id, ticker = %order.ticker, "Failed to enqueue order: {}", e);
            if let Err(cancel_err) = self.store.cancel_order(order.id, Utc::now()).await {
                error!(order_id = %order.id, "Failed to withdraw unindexed order: {}", cancel_err);
            }
            return Err(e);
        }

        MatcherMetrics::incr(&self.metrics.orders_submitted);
        debug!(
            order_id = %order.id,
            ticker = %order.ticker,
            side = %order.side,
            price = %order.price,
            amount = %order.amount,
            "Order accepted"
        );
        Ok(order)
    }

    /// Cancel a live order. It is marked non-matchable before it leaves the index.
    pub async fn cancel_order(&self, order_id: OrderId) -> MatchResult<Order> {
        let Some(order) = self.store.cancel_order(order_id, Utc::now()).await? else {
            let current = self
                .store
                .load_order(order_id)
                .await?
                .ok_or(MatchError::OrderNotFound { order_id: order_id.0 })?;
            self.lifecycle.validate_transition(&current, OrderStatus::Cancelled)?;
            // Changed between the conditional update and the read
            return Err(MatchError::InvalidTransition {
                order_id: order_id.0,
                from: current.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        };

        if let Err(e) = self.index.remove(order.side, &order.ticker, order.id).await {
            // The executor drops cancelled ids it finds, so this heals on a later tick
            warn!(order_id = %order.id, ticker = %order.ticker, "Failed to remove cancelled order from index: {}", e);
        }

        MatcherMetrics::incr(&self.metrics.orders_cancelled);
        info!(order_id = %order.id, ticker = %order.ticker, "Order cancelled");
        Ok(order)
    }

    /// Load an order
    pub async fn get_order(&self, order_id: OrderId) -> MatchResult<Order> {
        self.store
            .load_order(order_id)
            .await?
            .ok_or(MatchError::OrderNotFound { order_id: order_id.0 })
    }

    /// Executions recorded against an order
    pub async fn executions_for(&self, order_id: OrderId) -> MatchResult<Vec<Execution>> {
        self.store.executions_for(order_id).await
    }

    /// Subscribe to committed fills
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FillEvent> {
        self.notifier.subscribe()
    }

    /// Get metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> MatcherMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run one matching pass immediately, outside the timer
    pub async fn run_tick(&self) -> TickOutcome {
        self.scheduler.run_tick().await
    }

    /// Reconcile the index with the store
    pub async fn recover(&self) -> MatchResult<RecoveryStats> {
        RecoveryManager::new(self.store.clone(), self.index.clone())
            .recover()
            .await
    }

    /// Reconcile, then start the matching loop
    pub async fn start(&self) -> MatchResult<RecoveryStats> {
        let stats = self.recover().await?;

        let mut handle = self.scheduler_handle.lock();
        if handle.is_none() {
            self.shutdown_tx.send_replace(false);
            *handle = Some(self.scheduler.clone().start(self.shutdown_tx.subscribe()));
        }
        Ok(stats)
    }

    /// Stop the matching loop after the in-flight tick
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.scheduler_handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Scheduler task failed: {}", e);
        }
        info!("Order matcher stopped");
    }
}
