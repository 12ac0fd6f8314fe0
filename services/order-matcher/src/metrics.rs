//! Matcher counters

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live matcher counters, shared by the service, scheduler and executor
#[derive(Debug, Default)]
pub struct MatcherMetrics {
    /// Orders accepted
    pub orders_submitted: AtomicU64,
    /// Orders cancelled
    pub orders_cancelled: AtomicU64,
    /// Ticks that ran a matching pass
    pub ticks_run: AtomicU64,
    /// Ticks skipped because the market was closed
    pub ticks_market_closed: AtomicU64,
    /// Ticks skipped because the previous one was still running
    pub ticks_overlapped: AtomicU64,
    /// Ticks abandoned because the index was unavailable
    pub ticks_index_unavailable: AtomicU64,
    /// Order ids handed to the executor
    pub orders_processed: AtomicU64,
    /// Order ids whose processing failed
    pub orders_failed: AtomicU64,
    /// Committed fills
    pub fills: AtomicU64,
    /// Orders that reached `Filled`
    pub orders_filled: AtomicU64,
    /// Sum of fill amounts
    executed_volume: Mutex<Decimal>,
}

impl MatcherMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one committed fill
    pub fn record_fill(&self, amount: Decimal, completed_orders: u64) {
        self.fills.fetch_add(1, Ordering::Relaxed);
        self.orders_filled.fetch_add(completed_orders, Ordering::Relaxed);
        let mut volume = self.executed_volume.lock();
        *volume = volume.saturating_add(amount);
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MatcherMetricsSnapshot {
        MatcherMetricsSnapshot {
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            orders_cancelled: self.orders_cancelled.load(Ordering::Relaxed),
            ticks_run: self.ticks_run.load(Ordering::Relaxed),
            ticks_market_closed: self.ticks_market_closed.load(Ordering::Relaxed),
            ticks_overlapped: self.ticks_overlapped.load(Ordering::Relaxed),
            ticks_index_unavailable: self.ticks_index_unavailable.load(Ordering::Relaxed),
            orders_processed: self.orders_processed.load(Ordering::Relaxed),
            orders_failed: self.orders_failed.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            orders_filled: self.orders_filled.load(Ordering::Relaxed),
            executed_volume: *self.executed_volume.lock(),
        }
    }
}

/// Matcher metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatcherMetricsSnapshot {
    /// Orders accepted
    pub orders_submitted: u64,
    /// Orders cancelled
    pub orders_cancelled: u64,
    /// Ticks that ran a matching pass
    pub ticks_run: u64,
    /// Ticks skipped, market closed
    pub ticks_market_closed: u64,
    /// Ticks skipped, overlap
    pub ticks_overlapped: u64,
    /// Ticks abandoned, index unavailable
    pub ticks_index_unavailable: u64,
    /// Order ids handed to the executor
    pub orders_processed: u64,
    /// Order ids whose processing failed
    pub orders_failed: u64,
    /// Committed fills
    pub fills: u64,
    /// Orders that reached `Filled`
    pub orders_filled: u64,
    /// Sum of fill amounts
    pub executed_volume: Decimal,
}
