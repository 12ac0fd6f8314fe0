//! Matching scheduler
//!
//! Drives periodic matching passes. A tick is gated by market hours, never
//! overlaps a tick still in flight, drains buys before sells per ticker and
//! isolates failures to the order that caused them.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::market_hours::MarketHoursOracle;
use crate::matching::MatchExecutor;
use crate::metrics::MatcherMetrics;
use crate::order::Side;
use crate::waiting_index::WaitingOrderIndex;

/// Sides drained per ticker, in this order
const SIDE_ORDER: [Side; 2] = [Side::Buy, Side::Sell];

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Market closed; nothing was read or written
    MarketClosed,
    /// Previous tick still running; skipped
    Overlapped,
    /// Active tickers could not be listed; retried next tick
    IndexUnavailable,
    /// Pass completed (individual orders may have failed)
    Completed(TickReport),
}

/// Totals for a completed tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tickers visited
    pub tickers: usize,
    /// Tickers whose waiting ids could not be listed for at least one side
    pub tickers_failed: usize,
    /// Order ids handed to the executor
    pub orders_processed: usize,
    /// Order ids whose processing returned an error
    pub orders_failed: usize,
    /// Committed fills
    pub fills: usize,
    /// Executed amount across all fills, counted once per fill
    pub executed_amount: Decimal,
}

impl TickReport {
    fn absorb(&mut self, other: Self) {
        self.tickers += other.tickers;
        self.tickers_failed += other.tickers_failed;
        self.orders_processed += other.orders_processed;
        self.orders_failed += other.orders_failed;
        self.fills += other.fills;
        self.executed_amount += other.executed_amount;
    }
}

/// Matching scheduler
#[derive(Debug)]
pub struct MatchingScheduler {
    executor: Arc<MatchExecutor>,
    index: Arc<dyn WaitingOrderIndex>,
    market_hours: Arc<dyn MarketHoursOracle>,
    metrics: Arc<MatcherMetrics>,
    /// Held for the duration of a tick
    tick_guard: Arc<Mutex<()>>,
    /// Bounds tickers processed at once
    ticker_permits: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl MatchingScheduler {
    /// Create a new scheduler
    #[must_use]
    pub fn new(
        executor: Arc<MatchExecutor>,
        index: Arc<dyn WaitingOrderIndex>,
        market_hours: Arc<dyn MarketHoursOracle>,
        metrics: Arc<MatcherMetrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            index,
            market_hours,
            metrics,
            tick_guard: Arc::new(Mutex::new(())),
            ticker_permits: Arc::new(Semaphore::new(config.max_concurrent_tickers.max(1))),
            config,
        }
    }

    /// Run one matching pass now
    pub async fn run_tick(&self) -> TickOutcome {
        if !self.market_hours.is_market_open(Utc::now()) {
            MatcherMetrics::incr(&self.metrics.ticks_market_closed);
            debug!("Market closed, skipping tick");
            return TickOutcome::MarketClosed;
        }

        let Ok(_guard) = self.tick_guard.clone().try_lock_owned() else {
            MatcherMetrics::incr(&self.metrics.ticks_overlapped);
            warn!("Previous tick still running, skipping");
            return TickOutcome::Overlapped;
        };

        let tickers = match self.index.list_tickers_with_activity().await {
            Ok(tickers) => tickers,
            Err(e) => {
                MatcherMetrics::incr(&self.metrics.ticks_index_unavailable);
                warn!("Could not list active tickers, retrying next tick: {}", e);
                return TickOutcome::IndexUnavailable;
            }
        };

        let mut tasks = JoinSet::new();
        for ticker in tickers {
            let executor = self.executor.clone();
            let index = self.index.clone();
            let metrics = self.metrics.clone();
            let permits = self.ticker_permits.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                drain_ticker(&executor, index.as_ref(), &metrics, &ticker).await
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ticker_report) => report.absorb(ticker_report),
                Err(e) => {
                    error!("Ticker task aborted: {}", e);
                    report.tickers += 1;
                    report.tickers_failed += 1;
                }
            }
        }

        MatcherMetrics::incr(&self.metrics.ticks_run);
        if report.fills > 0 || report.orders_failed > 0 {
            info!(
                tickers = report.tickers,
                processed = report.orders_processed,
                failed = report.orders_failed,
                fills = report.fills,
                "Tick completed"
            );
        } else {
            debug!(tickers = report.tickers, processed = report.orders_processed, "Tick completed");
        }
        TickOutcome::Completed(report)
    }

    /// Spawn the timer loop. It stops once `shutdown` turns `true`, after
    /// any in-flight tick has finished.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(self.config.tick_interval());
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.config.tick_interval_ms, "Matching scheduler started");
            let mut last_tick: Option<JoinHandle<TickOutcome>> = None;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let scheduler = self.clone();
                        last_tick = Some(tokio::spawn(async move { scheduler.run_tick().await }));
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // Wait out the tick in flight, if any
            if let Some(handle) = last_tick
                && let Err(e) = handle.await
            {
                error!("Tick task aborted: {}", e);
            }
            drop(self.tick_guard.lock().await);
            info!("Matching scheduler stopped");
        })
    }
}

/// Buys then sells for one ticker, serially
async fn drain_ticker(
    executor: &MatchExecutor,
    index: &dyn WaitingOrderIndex,
    metrics: &MatcherMetrics,
    ticker: &str,
) -> TickReport {
    let mut report = TickReport {
        tickers: 1,
        ..TickReport::default()
    };
    let mut side_failed = false;

    for side in SIDE_ORDER {
        let order_ids = match index.list_waiting_ids(side, ticker).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(ticker, side = %side, "Could not list waiting orders: {}", e);
                side_failed = true;
                continue;
            }
        };

        for order_id in order_ids {
            report.orders_processed += 1;
            MatcherMetrics::incr(&metrics.orders_processed);

            match executor.process_order(order_id, ticker).await {
                Ok(match_report) => {
                    report.fills += match_report.fills.len();
                    report.executed_amount += match_report.executed_amount();
                }
                Err(e) => {
                    report.orders_failed += 1;
                    MatcherMetrics::incr(&metrics.orders_failed);
                    error!(
                        order_id = %order_id,
                        ticker,
                        retryable = e.is_retryable(),
                        "Order processing failed: {}",
                        e
                    );
                }
            }
        }
    }

    if side_failed {
        report.tickers_failed = 1;
    }
    report
}
