//! Order lifecycle management

use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{MatchError, MatchResult};
use crate::order::{Order, OrderRequest, OrderStatus};

/// Order lifecycle manager
#[derive(Debug)]
pub struct OrderLifecycleManager {
    /// Valid state transitions
    valid_transitions: FxHashMap<OrderStatus, Vec<OrderStatus>>,
    /// Tradable tickers; empty means any ticker is accepted
    universe: FxHashSet<String>,
}

impl Default for OrderLifecycleManager {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl OrderLifecycleManager {
    /// Create new lifecycle manager for the given ticker universe
    #[must_use]
    pub fn new(universe: impl IntoIterator<Item = String>) -> Self {
        let mut valid_transitions = FxHashMap::default();

        valid_transitions.insert(
            OrderStatus::Open,
            vec![
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::Cancelled,
            ],
        );

        // A further partial fill keeps the order partially filled
        valid_transitions.insert(
            OrderStatus::PartiallyFilled,
            vec![
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::Cancelled,
            ],
        );

        // Terminal states have no transitions
        valid_transitions.insert(OrderStatus::Filled, vec![]);
        valid_transitions.insert(OrderStatus::Cancelled, vec![]);

        Self {
            valid_transitions,
            universe: universe.into_iter().collect(),
        }
    }

    /// Validate an order request before it is stored
    pub fn validate_request(&self, request: &OrderRequest) -> MatchResult<()> {
        let invalid = |reason: &str| MatchError::InvalidOrder {
            reason: reason.to_string(),
        };

        if request.ticker.trim().is_empty() {
            return Err(invalid("ticker is required"));
        }
        if !self.universe.is_empty() && !self.universe.contains(&request.ticker) {
            return Err(MatchError::InvalidOrder {
                reason: format!("ticker {} is not tradable", request.ticker),
            });
        }
        if request.amount <= Decimal::ZERO {
            return Err(invalid("order amount must be positive"));
        }
        if request.price <= Decimal::ZERO {
            return Err(invalid("limit price must be positive"));
        }

        debug!("Order request for {} validated", request.ticker);
        Ok(())
    }

    /// Validate state transition
    pub fn validate_transition(&self, order: &Order, new_status: OrderStatus) -> MatchResult<()> {
        let current_status = order.status;

        if let Some(valid_next_states) = self.valid_transitions.get(&current_status)
            && valid_next_states.contains(&new_status)
        {
            return Ok(());
        }

        Err(MatchError::InvalidTransition {
            order_id: order.id.0,
            from: current_status.to_string(),
            to: new_status.to_string(),
        })
    }
}
