//! Order, execution and fill-event definitions

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MatchError, MatchResult};

/// Scale (decimal places) used for average executed prices unless configured
pub const DEFAULT_PRICE_SCALE: u32 = 2;

/// Store-issued order identifier. Lower ids were created earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-issued execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub i64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy order (bid)
    Buy,
    /// Sell order (ask)
    Sell,
}

impl Side {
    /// The side an order of this side trades against
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Wire/storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            _ => Err(MatchError::InvalidOrder {
                reason: format!("Invalid order side: {s}"),
            }),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Resting, nothing executed yet
    Open,
    /// Some quantity executed, remainder still resting
    PartiallyFilled,
    /// Fully executed (terminal)
    Filled,
    /// Withdrawn by the owner (terminal)
    Cancelled,
}

impl OrderStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Check if status is terminal
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(MatchError::InvalidOrder {
                reason: format!("Invalid order status: {s}"),
            }),
        }
    }
}

/// Limit order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID
    pub id: OrderId,
    /// Ticker symbol
    pub ticker: String,
    /// Order side
    pub side: Side,
    /// Limit price
    pub price: Decimal,
    /// Original amount
    pub amount: Decimal,
    /// Executed amount
    pub executed_amount: Decimal,
    /// Remaining amount (`amount - executed_amount`)
    pub remaining_amount: Decimal,
    /// Sum of `price * amount` over every fill
    pub executed_value: Decimal,
    /// Quantity-weighted average execution price
    pub avg_executed_price: Option<Decimal>,
    /// Order status
    pub status: OrderStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Request for a new limit order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Ticker symbol
    pub ticker: String,
    /// Side
    pub side: Side,
    /// Limit price
    pub price: Decimal,
    /// Amount
    pub amount: Decimal,
}

impl Order {
    /// Build a fresh open order from a request
    #[must_use]
    pub fn open(id: OrderId, request: OrderRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            ticker: request.ticker,
            side: request.side,
            price: request.price,
            amount: request.amount,
            executed_amount: Decimal::ZERO,
            remaining_amount: request.amount,
            executed_value: Decimal::ZERO,
            avg_executed_price: None,
            status: OrderStatus::Open,
            created_at,
            updated_at: created_at,
        }
    }

    /// Check if order is terminal
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// An order can take part in a fill while it is live and has quantity left
    #[must_use]
    pub fn is_matchable(&self) -> bool {
        !self.is_terminal() && self.remaining_amount > Decimal::ZERO
    }

    /// Whether this order may execute at `price` without violating its limit
    #[must_use]
    pub fn accepts_price(&self, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price <= self.price,
            Side::Sell => price >= self.price,
        }
    }

    /// Status implied by the executed/remaining amounts
    #[must_use]
    pub fn derived_status(&self) -> OrderStatus {
        if self.status == OrderStatus::Cancelled {
            OrderStatus::Cancelled
        } else if self.remaining_amount.is_zero() {
            OrderStatus::Filled
        } else if self.executed_amount.is_zero() {
            OrderStatus::Open
        } else {
            OrderStatus::PartiallyFilled
        }
    }

    /// Apply one fill of `fill_amount` at `price`.
    ///
    /// Amount, value and average price are updated together; nothing changes
    /// if any step overflows or the fill would overfill the order.
    pub fn apply_fill(
        &mut self,
        fill_amount: Decimal,
        price: Decimal,
        price_scale: u32,
        at: DateTime<Utc>,
    ) -> MatchResult<()> {
        let order_id = self.id.0;
        let arithmetic = move |details: &str| MatchError::Arithmetic {
            order_id,
            details: details.to_string(),
        };

        if fill_amount <= Decimal::ZERO {
            return Err(arithmetic("fill amount must be positive"));
        }
        if fill_amount > self.remaining_amount {
            return Err(arithmetic("fill exceeds remaining amount"));
        }

        let executed_amount = self
            .executed_amount
            .checked_add(fill_amount)
            .ok_or_else(|| arithmetic("executed amount overflow"))?;
        let remaining_amount = self
            .amount
            .checked_sub(executed_amount)
            .ok_or_else(|| arithmetic("remaining amount overflow"))?;
        let fill_value = price
            .checked_mul(fill_amount)
            .ok_or_else(|| arithmetic("fill value overflow"))?;
        let executed_value = self
            .executed_value
            .checked_add(fill_value)
            .ok_or_else(|| arithmetic("executed value overflow"))?;
        let avg = average_price(executed_value, executed_amount, price_scale)
            .ok_or_else(|| arithmetic("average price overflow"))?;

        self.executed_amount = executed_amount;
        self.remaining_amount = remaining_amount;
        self.executed_value = executed_value;
        self.avg_executed_price = Some(avg);
        self.status = self.derived_status();
        self.updated_at = at;
        Ok(())
    }
}

/// Quantity-weighted mean, rounded half-up to `scale` decimal places
#[must_use]
pub fn average_price(executed_value: Decimal, executed_amount: Decimal, scale: u32) -> Option<Decimal> {
    if executed_amount.is_zero() {
        return None;
    }
    executed_value
        .checked_div(executed_amount)
        .map(|avg| avg.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero))
}

/// One side of a fill, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution ID
    pub id: ExecutionId,
    /// Order that was filled
    pub order_id: OrderId,
    /// Order on the other side of the fill
    pub counter_order_id: OrderId,
    /// Executed price
    pub executed_price: Decimal,
    /// Executed amount
    pub executed_amount: Decimal,
    /// Execution timestamp
    pub executed_at: DateTime<Utc>,
}

/// Event published after a fill has been committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Ticker symbol
    pub ticker: String,
    /// Buying order
    pub buy_order_id: OrderId,
    /// Selling order
    pub sell_order_id: OrderId,
    /// Order being processed when the fill happened
    pub incoming_order_id: OrderId,
    /// Resting order whose price set the trade
    pub resting_order_id: OrderId,
    /// Trade price
    pub price: Decimal,
    /// Trade amount
    pub amount: Decimal,
    /// Status of the incoming order after the fill
    pub incoming_status: OrderStatus,
    /// Status of the resting order after the fill
    pub resting_status: OrderStatus,
    /// Fill timestamp
    pub executed_at: DateTime<Utc>,
}

impl FillEvent {
    /// Whether this fill completed the given order
    #[must_use]
    pub fn completes(&self, order_id: OrderId) -> bool {
        (order_id == self.incoming_order_id && self.incoming_status == OrderStatus::Filled)
            || (order_id == self.resting_order_id && self.resting_status == OrderStatus::Filled)
    }
}
