//! Startup reconciliation
//!
//! Brings the waiting-order index back in line with the store after a
//! restart or an interrupted writer: live orders missing from the index are
//! enqueued, indexed ids without a live order are removed.

use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::MatchResult;
use crate::order::{Order, OrderId, Side};
use crate::persistence::OrderStore;
use crate::waiting_index::WaitingOrderIndex;

/// Recovery statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Live orders found in the store
    pub live_orders: usize,
    /// Live orders that were missing from the index
    pub orders_enqueued: usize,
    /// Index entries without a live order
    pub stale_removed: usize,
    /// Orders whose amounts or status are inconsistent
    pub discrepancies_found: usize,
    /// Recovery time (ms)
    pub recovery_time_ms: u64,
}

/// Reconciles the index with the store
#[derive(Debug)]
pub struct RecoveryManager {
    store: Arc<dyn OrderStore>,
    index: Arc<dyn WaitingOrderIndex>,
}

fn is_consistent(order: &Order) -> bool {
    order.remaining_amount >= Decimal::ZERO
        && order.amount - order.executed_amount == order.remaining_amount
        && order.derived_status() == order.status
}

impl RecoveryManager {
    /// Create new recovery manager
    #[must_use]
    pub fn new(store: Arc<dyn OrderStore>, index: Arc<dyn WaitingOrderIndex>) -> Self {
        Self { store, index }
    }

    /// Perform full reconciliation
    pub async fn recover(&self) -> MatchResult<RecoveryStats> {
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        info!("Starting waiting-order index reconciliation");

        let live_orders = self.store.load_live_orders().await?;
        stats.live_orders = live_orders.len();

        let mut live_by_book: FxHashMap<(Side, String), Vec<&Order>> = FxHashMap::default();
        for order in &live_orders {
            if !is_consistent(order) {
                warn!(
                    order_id = %order.id,
                    ticker = %order.ticker,
                    "Order amounts inconsistent: amount {} executed {} remaining {} status {}",
                    order.amount,
                    order.executed_amount,
                    order.remaining_amount,
                    order.status
                );
                stats.discrepancies_found += 1;
                continue;
            }
            if order.is_matchable() {
                live_by_book
                    .entry((order.side, order.ticker.clone()))
                    .or_default()
                    .push(order);
            }
        }

        let mut tickers: BTreeSet<String> =
            self.index.list_tickers_with_activity().await?.into_iter().collect();
        tickers.extend(live_by_book.keys().map(|(_, ticker)| ticker.clone()));

        for ticker in &tickers {
            for side in [Side::Buy, Side::Sell] {
                let indexed: FxHashSet<OrderId> = self
                    .index
                    .list_waiting_ids(side, ticker)
                    .await?
                    .into_iter()
                    .collect();
                let live = live_by_book
                    .get(&(side, ticker.clone()))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let live_ids: FxHashSet<OrderId> = live.iter().map(|o| o.id).collect();

                for order in live.iter().filter(|o| !indexed.contains(&o.id)) {
                    debug!(order_id = %order.id, ticker = %ticker, "Enqueuing order missing from index");
                    self.index.enqueue(side, ticker, order.id, order.price).await?;
                    stats.orders_enqueued += 1;
                }

                for stale_id in indexed.iter().filter(|id| !live_ids.contains(*id)) {
                    debug!(order_id = %stale_id, ticker = %ticker, "Removing stale index entry");
                    if self.index.remove(side, ticker, *stale_id).await? {
                        stats.stale_removed += 1;
                    }
                }
            }
        }

        stats.recovery_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            "Reconciliation completed: {} live orders, {} enqueued, {} stale removed, {} discrepancies in {}ms",
            stats.live_orders,
            stats.orders_enqueued,
            stats.stale_removed,
            stats.discrepancies_found,
            stats.recovery_time_ms
        );

        Ok(stats)
    }
}
