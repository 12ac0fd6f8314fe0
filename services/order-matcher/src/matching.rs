//! Match executor
//!
//! Price-time priority matching of one waiting order against the resting
//! orders on the other side of its ticker. The waiting-order index only
//! nominates candidates; every price and quantity decision is made on order
//! records re-read from the store, and every fill is committed atomically
//! before the index is touched or anyone is notified.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MatchError, MatchResult};
use crate::lifecycle::OrderLifecycleManager;
use crate::metrics::MatcherMetrics;
use crate::notify::FillNotifier;
use crate::order::{Execution, FillEvent, Order, OrderId, OrderStatus, Side};
use crate::persistence::{FillCommit, FillOutcome, OrderStore};
use crate::waiting_index::WaitingOrderIndex;

/// What processing one order did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchReport {
    /// Order that was processed
    pub order_id: OrderId,
    /// Status after processing; `None` if the order does not exist
    pub status: Option<OrderStatus>,
    /// Committed fills, in execution order
    pub fills: Vec<FillEvent>,
    /// Executions recorded against the processed order, one per fill
    pub executions: Vec<Execution>,
    /// Index entries removed because their order was missing or terminal
    pub stale_removed: usize,
}

impl MatchReport {
    fn empty(order_id: OrderId, status: Option<OrderStatus>) -> Self {
        Self {
            order_id,
            status,
            fills: Vec::new(),
            executions: Vec::new(),
            stale_removed: 0,
        }
    }

    /// Total amount executed for the processed order
    #[must_use]
    pub fn executed_amount(&self) -> Decimal {
        self.fills.iter().map(|f| f.amount).sum()
    }

    /// Whether nothing was filled
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.fills.is_empty()
    }
}

/// Ordering of counter orders for an incoming order on `side`: best price
/// for the incoming order first, then earliest creation, then lowest id
fn counter_priority(side: Side, a: &Order, b: &Order) -> Ordering {
    let by_price = match side {
        Side::Buy => a.price.cmp(&b.price),
        Side::Sell => b.price.cmp(&a.price),
    };
    by_price
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Match executor
#[derive(Debug)]
pub struct MatchExecutor {
    store: Arc<dyn OrderStore>,
    index: Arc<dyn WaitingOrderIndex>,
    notifier: Arc<dyn FillNotifier>,
    lifecycle: Arc<OrderLifecycleManager>,
    metrics: Arc<MatcherMetrics>,
    price_scale: u32,
}

impl MatchExecutor {
    /// Create a new executor
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        index: Arc<dyn WaitingOrderIndex>,
        notifier: Arc<dyn FillNotifier>,
        lifecycle: Arc<OrderLifecycleManager>,
        metrics: Arc<MatcherMetrics>,
        price_scale: u32,
    ) -> Self {
        Self {
            store,
            index,
            notifier,
            lifecycle,
            metrics,
            price_scale,
        }
    }

    /// Match `order_id` against resting liquidity on `ticker`.
    ///
    /// A missing or terminal order is a no-op. Counter orders that were
    /// cancelled or changed concurrently are skipped.
    pub async fn process_order(&self, order_id: OrderId, ticker: &str) -> MatchResult<MatchReport> {
        let Some(mut incoming) = self.store.load_order(order_id).await? else {
            debug!(order_id = %order_id, ticker, "Order no longer exists, skipping");
            return Ok(MatchReport::empty(order_id, None));
        };

        if incoming.ticker != ticker {
            return Err(MatchError::InvalidOrder {
                reason: format!(
                    "order {} is indexed under {} but trades {}",
                    order_id, ticker, incoming.ticker
                ),
            });
        }

        if !incoming.is_matchable() {
            debug!(order_id = %order_id, ticker, status = %incoming.status, "Order not matchable, skipping");
            let mut report = MatchReport::empty(order_id, Some(incoming.status));
            if self.index.remove(incoming.side, ticker, order_id).await? {
                report.stale_removed += 1;
            }
            return Ok(report);
        }

        let mut report = MatchReport::empty(order_id, Some(incoming.status));
        let candidates = self.load_candidates(&incoming, &mut report).await?;

        for counter in candidates {
            if !incoming.is_matchable() {
                break;
            }

            let fill_amount = incoming.remaining_amount.min(counter.remaining_amount);
            let price = counter.price;
            let executed_at = Utc::now();

            let mut incoming_after = incoming.clone();
            let mut counter_after = counter.clone();
            incoming_after.apply_fill(fill_amount, price, self.price_scale, executed_at)?;
            counter_after.apply_fill(fill_amount, price, self.price_scale, executed_at)?;
            self.lifecycle.validate_transition(&incoming, incoming_after.status)?;
            self.lifecycle.validate_transition(&counter, counter_after.status)?;

            let commit = FillCommit {
                incoming_expected_remaining: incoming.remaining_amount,
                incoming: incoming_after,
                counter_expected_remaining: counter.remaining_amount,
                counter: counter_after,
                price,
                amount: fill_amount,
                executed_at,
            };

            match self.store.commit_fill(&commit).await? {
                FillOutcome::Committed(receipt) => {
                    let FillCommit {
                        incoming: incoming_after,
                        counter: counter_after,
                        ..
                    } = commit;
                    incoming = incoming_after;

                    let event = fill_event(&incoming, &counter_after, price, fill_amount, executed_at);
                    info!(
                        ticker,
                        incoming = %incoming.id,
                        resting = %counter_after.id,
                        incoming_execution = %receipt.incoming_execution.id,
                        resting_execution = %receipt.counter_execution.id,
                        %price,
                        amount = %fill_amount,
                        "Fill committed"
                    );

                    let completed = u64::from(incoming.status == OrderStatus::Filled)
                        + u64::from(counter_after.status == OrderStatus::Filled);
                    self.metrics.record_fill(fill_amount, completed);

                    if counter_after.status == OrderStatus::Filled {
                        self.remove_completed(counter_after.side, ticker, counter_after.id).await;
                    }

                    if let Err(e) = self.notifier.notify(&event).await {
                        warn!(ticker, incoming = %incoming.id, resting = %counter_after.id, "Fill notification failed: {}", e);
                    }
                    report.fills.push(event);
                    report.executions.push(receipt.incoming_execution);
                }
                FillOutcome::CounterUnavailable => {
                    debug!(ticker, counter = %counter.id, "Counter order changed concurrently, skipping leg");
                }
                FillOutcome::IncomingUnavailable => {
                    debug!(order_id = %order_id, ticker, "Order changed concurrently, stopping");
                    break;
                }
            }
        }

        if incoming.status == OrderStatus::Filled {
            self.remove_completed(incoming.side, ticker, incoming.id).await;
        }

        report.status = Some(incoming.status);
        if !report.is_noop() {
            debug!(
                "Order {} matched {} times, remaining {}",
                order_id,
                report.fills.len(),
                incoming.remaining_amount
            );
        }
        Ok(report)
    }

    /// Price-compatible, still-live counter orders in priority order.
    /// Stale index entries found on the way are removed.
    async fn load_candidates(&self, incoming: &Order, report: &mut MatchReport) -> MatchResult<Vec<Order>> {
        let counter_side = incoming.side.opposite();
        let ticker = incoming.ticker.as_str();

        let counter_ids = self.index.list_waiting_ids(counter_side, ticker).await?;
        if counter_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut loaded: FxHashMap<OrderId, Order> = self
            .store
            .load_orders(&counter_ids)
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();
        let mut candidates = Vec::with_capacity(loaded.len());

        for counter_id in counter_ids {
            match loaded.remove(&counter_id) {
                Some(order) if order.is_matchable() && order.side == counter_side && order.ticker == ticker => {
                    if incoming.accepts_price(order.price) {
                        candidates.push(order);
                    }
                }
                _ => {
                    debug!(ticker, counter = %counter_id, "Removing stale index entry");
                    if self.index.remove(counter_side, ticker, counter_id).await? {
                        report.stale_removed += 1;
                    }
                }
            }
        }

        candidates.sort_by(|a, b| counter_priority(incoming.side, a, b));
        Ok(candidates)
    }

    /// Drop a filled order from the index. A failure here is healed on a
    /// later tick, when the order is found terminal.
    async fn remove_completed(&self, side: Side, ticker: &str, order_id: OrderId) {
        if let Err(e) = self.index.remove(side, ticker, order_id).await {
            warn!(order_id = %order_id, ticker, "Failed to remove filled order from index: {}", e);
        }
    }
}

fn fill_event(
    incoming: &Order,
    resting: &Order,
    price: Decimal,
    amount: Decimal,
    executed_at: DateTime<Utc>,
) -> FillEvent {
    let (buy_order_id, sell_order_id) = match incoming.side {
        Side::Buy => (incoming.id, resting.id),
        Side::Sell => (resting.id, incoming.id),
    };

    FillEvent {
        ticker: incoming.ticker.clone(),
        buy_order_id,
        sell_order_id,
        incoming_order_id: incoming.id,
        resting_order_id: resting.id,
        price,
        amount,
        incoming_status: incoming.status,
        resting_status: resting.status,
        executed_at,
    }
}
