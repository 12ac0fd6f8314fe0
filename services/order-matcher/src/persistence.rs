//! Order and execution persistence
//!
//! The store is the single source of truth for quantities and status.
//! A fill is committed as one unit: both order rows are re-checked, both
//! executions appended and both orders updated, or nothing is written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use tracing::{debug, info};

use crate::error::MatchResult;
use crate::order::{Execution, ExecutionId, Order, OrderId, OrderRequest, OrderStatus};

/// Everything needed to commit one fill between two orders
#[derive(Debug, Clone)]
pub struct FillCommit {
    /// Remaining amount of the incoming order when it was read
    pub incoming_expected_remaining: Decimal,
    /// Incoming order with the fill applied
    pub incoming: Order,
    /// Remaining amount of the counter order when it was read
    pub counter_expected_remaining: Decimal,
    /// Counter order with the fill applied
    pub counter: Order,
    /// Execution price
    pub price: Decimal,
    /// Execution amount
    pub amount: Decimal,
    /// Execution timestamp
    pub executed_at: DateTime<Utc>,
}

/// Executions written for a committed fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillReceipt {
    /// Execution recorded against the incoming order
    pub incoming_execution: Execution,
    /// Execution recorded against the counter order
    pub counter_execution: Execution,
}

/// Result of attempting a fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// Both legs written
    Committed(FillReceipt),
    /// The incoming order changed or left the matchable states since it was read
    IncomingUnavailable,
    /// The counter order changed or left the matchable states since it was read
    CounterUnavailable,
}

/// Durable order and execution records
#[async_trait]
pub trait OrderStore: Send + Sync + fmt::Debug {
    /// Store a new open order and assign its id
    async fn insert_order(&self, request: OrderRequest, created_at: DateTime<Utc>) -> MatchResult<Order>;

    /// Load order by ID
    async fn load_order(&self, order_id: OrderId) -> MatchResult<Option<Order>>;

    /// Load several orders; ids that do not exist are skipped
    async fn load_orders(&self, order_ids: &[OrderId]) -> MatchResult<Vec<Order>>;

    /// Commit one fill atomically
    async fn commit_fill(&self, fill: &FillCommit) -> MatchResult<FillOutcome>;

    /// Mark a live order cancelled. `None` if missing or already terminal.
    async fn cancel_order(&self, order_id: OrderId, at: DateTime<Utc>) -> MatchResult<Option<Order>>;

    /// Executions recorded against an order, oldest first
    async fn executions_for(&self, order_id: OrderId) -> MatchResult<Vec<Execution>>;

    /// Every order that is not terminal
    async fn load_live_orders(&self) -> MatchResult<Vec<Order>>;
}

fn leg_is_current(current: Option<&Order>, expected_remaining: Decimal) -> bool {
    current.is_some_and(|order| order.is_matchable() && order.remaining_amount == expected_remaining)
}

#[derive(Debug)]
struct InMemoryState {
    orders: FxHashMap<OrderId, Order>,
    executions: Vec<Execution>,
    next_order_id: i64,
    next_execution_id: i64,
}

/// Store kept entirely in process memory
#[derive(Debug)]
pub struct InMemoryOrderStore {
    state: Mutex<InMemoryState>,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                orders: FxHashMap::default(),
                executions: Vec::new(),
                next_order_id: 1,
                next_execution_id: 1,
            }),
        }
    }

    /// Every execution recorded so far
    #[must_use]
    pub fn all_executions(&self) -> Vec<Execution> {
        self.state.lock().executions.clone()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_order(&self, request: OrderRequest, created_at: DateTime<Utc>) -> MatchResult<Order> {
        let mut state = self.state.lock();
        let order_id = OrderId(state.next_order_id);
        state.next_order_id += 1;

        let order = Order::open(order_id, request, created_at);
        state.orders.insert(order_id, order.clone());
        Ok(order)
    }

    async fn load_order(&self, order_id: OrderId) -> MatchResult<Option<Order>> {
        Ok(self.state.lock().orders.get(&order_id).cloned())
    }

    async fn load_orders(&self, order_ids: &[OrderId]) -> MatchResult<Vec<Order>> {
        let state = self.state.lock();
        Ok(order_ids
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect())
    }

    async fn commit_fill(&self, fill: &FillCommit) -> MatchResult<FillOutcome> {
        let mut state = self.state.lock();

        if !leg_is_current(state.orders.get(&fill.incoming.id), fill.incoming_expected_remaining) {
            return Ok(FillOutcome::IncomingUnavailable);
        }
        if !leg_is_current(state.orders.get(&fill.counter.id), fill.counter_expected_remaining) {
            return Ok(FillOutcome::CounterUnavailable);
        }

        let mut record = |order_id: OrderId, counter_order_id: OrderId| {
            let execution = Execution {
                id: ExecutionId(state.next_execution_id),
                order_id,
                counter_order_id,
                executed_price: fill.price,
                executed_amount: fill.amount,
                executed_at: fill.executed_at,
            };
            state.next_execution_id += 1;
            state.executions.push(execution.clone());
            execution
        };
        let incoming_execution = record(fill.incoming.id, fill.counter.id);
        let counter_execution = record(fill.counter.id, fill.incoming.id);

        state.orders.insert(fill.incoming.id, fill.incoming.clone());
        state.orders.insert(fill.counter.id, fill.counter.clone());

        Ok(FillOutcome::Committed(FillReceipt {
            incoming_execution,
            counter_execution,
        }))
    }

    async fn cancel_order(&self, order_id: OrderId, at: DateTime<Utc>) -> MatchResult<Option<Order>> {
        let mut state = self.state.lock();
        match state.orders.get_mut(&order_id) {
            Some(order) if !order.is_terminal() => {
                order.status = OrderStatus::Cancelled;
                order.updated_at = at;
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn executions_for(&self, order_id: OrderId) -> MatchResult<Vec<Execution>> {
        Ok(self
            .state
            .lock()
            .executions
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn load_live_orders(&self) -> MatchResult<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }
}

/// `PostgreSQL` order store
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    /// Database pool
    db_pool: PgPool,
}

const ORDER_COLUMNS: &str = "id, ticker, side, price, amount, executed_amount, remaining_amount, \
     executed_value, avg_executed_price, status, created_at, updated_at";

impl PgOrderStore {
    /// Create new store over an existing pool
    #[must_use]
    pub const fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    async fn update_after_fill(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order: &Order,
    ) -> MatchResult<()> {
        sqlx::query(
            r"
            UPDATE orders SET
                executed_amount = $1,
                remaining_amount = $2,
                executed_value = $3,
                avg_executed_price = $4,
                status = $5,
                updated_at = $6
            WHERE id = $7
            ",
        )
        .bind(order.executed_amount)
        .bind(order.remaining_amount)
        .bind(order.executed_value)
        .bind(order.avg_executed_price)
        .bind(order.status.as_str())
        .bind(order.updated_at)
        .bind(order.id.0)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_execution(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        order_id: OrderId,
        counter_order_id: OrderId,
        fill: &FillCommit,
    ) -> MatchResult<Execution> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO executions (
                order_id, counter_order_id, executed_price, executed_amount, executed_at
            ) VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(order_id.0)
        .bind(counter_order_id.0)
        .bind(fill.price)
        .bind(fill.amount)
        .bind(fill.executed_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Execution {
            id: ExecutionId(id),
            order_id,
            counter_order_id,
            executed_price: fill.price,
            executed_amount: fill.amount,
            executed_at: fill.executed_at,
        })
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert_order(&self, request: OrderRequest, created_at: DateTime<Utc>) -> MatchResult<Order> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO orders (
                ticker, side, price, amount, executed_amount, remaining_amount,
                executed_value, avg_executed_price, status, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, 0, $4, 0, NULL, $5, $6, $6)
            RETURNING id
            ",
        )
        .bind(&request.ticker)
        .bind(request.side.as_str())
        .bind(request.price)
        .bind(request.amount)
        .bind(OrderStatus::Open.as_str())
        .bind(created_at)
        .fetch_one(&self.db_pool)
        .await?;

        debug!("Order {} persisted", id);
        Ok(Order::open(OrderId(id), request, created_at))
    }

    async fn load_order(&self, order_id: OrderId) -> MatchResult<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id.0)
            .fetch_optional(&self.db_pool)
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn load_orders(&self, order_ids: &[OrderId]) -> MatchResult<Vec<Order>> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = order_ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.db_pool)
            .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn commit_fill(&self, fill: &FillCommit) -> MatchResult<FillOutcome> {
        let mut tx = self.db_pool.begin().await?;

        // Lock both rows in id order so concurrent fills cannot deadlock
        let ids = vec![fill.incoming.id.0, fill.counter.id.0];
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;

        let current: Vec<Order> = rows.iter().map(order_from_row).collect::<MatchResult<_>>()?;
        let find = |id: OrderId| current.iter().find(|o| o.id == id);

        // Dropping the transaction rolls it back
        if !leg_is_current(find(fill.incoming.id), fill.incoming_expected_remaining) {
            return Ok(FillOutcome::IncomingUnavailable);
        }
        if !leg_is_current(find(fill.counter.id), fill.counter_expected_remaining) {
            return Ok(FillOutcome::CounterUnavailable);
        }

        let incoming_execution =
            Self::insert_execution(&mut tx, fill.incoming.id, fill.counter.id, fill).await?;
        let counter_execution =
            Self::insert_execution(&mut tx, fill.counter.id, fill.incoming.id, fill).await?;
        Self::update_after_fill(&mut tx, &fill.incoming).await?;
        Self::update_after_fill(&mut tx, &fill.counter).await?;

        tx.commit().await?;

        debug!(
            "Fill committed: {} x {} between orders {} and {}",
            fill.amount, fill.price, fill.incoming.id, fill.counter.id
        );
        Ok(FillOutcome::Committed(FillReceipt {
            incoming_execution,
            counter_execution,
        }))
    }

    async fn cancel_order(&self, order_id: OrderId, at: DateTime<Utc>) -> MatchResult<Option<Order>> {
        let row = sqlx::query(&format!(
            r"
            UPDATE orders SET status = $1, updated_at = $2
            WHERE id = $3 AND status IN ($4, $5)
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(OrderStatus::Cancelled.as_str())
        .bind(at)
        .bind(order_id.0)
        .bind(OrderStatus::Open.as_str())
        .bind(OrderStatus::PartiallyFilled.as_str())
        .fetch_optional(&self.db_pool)
        .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn executions_for(&self, order_id: OrderId) -> MatchResult<Vec<Execution>> {
        let rows = sqlx::query(
            r"
            SELECT id, order_id, counter_order_id, executed_price, executed_amount, executed_at
            FROM executions
            WHERE order_id = $1
            ORDER BY id
            ",
        )
        .bind(order_id.0)
        .fetch_all(&self.db_pool)
        .await?;

        rows.iter()
            .map(|row| -> MatchResult<Execution> {
                Ok(Execution {
                    id: ExecutionId(row.try_get("id")?),
                    order_id: OrderId(row.try_get("order_id")?),
                    counter_order_id: OrderId(row.try_get("counter_order_id")?),
                    executed_price: row.try_get("executed_price")?,
                    executed_amount: row.try_get("executed_amount")?,
                    executed_at: row.try_get("executed_at")?,
                })
            })
            .collect()
    }

    async fn load_live_orders(&self) -> MatchResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status IN ($1, $2) ORDER BY id"
        ))
        .bind(OrderStatus::Open.as_str())
        .bind(OrderStatus::PartiallyFilled.as_str())
        .fetch_all(&self.db_pool)
        .await?;

        let orders = rows.iter().map(order_from_row).collect::<MatchResult<Vec<_>>>()?;
        info!("Loaded {} live orders from database", orders.len());
        Ok(orders)
    }
}

/// Build an order from a row selected with the standard column list
pub fn order_from_row(row: &PgRow) -> MatchResult<Order> {
    Ok(Order {
        id: OrderId(row.try_get("id")?),
        ticker: row.try_get("ticker")?,
        side: row.try_get::<String, _>("side")?.parse()?,
        price: row.try_get("price")?,
        amount: row.try_get("amount")?,
        executed_amount: row.try_get("executed_amount")?,
        remaining_amount: row.try_get("remaining_amount")?,
        executed_value: row.try_get("executed_value")?,
        avg_executed_price: row.try_get("avg_executed_price")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS orders (
        id BIGSERIAL PRIMARY KEY,
        ticker TEXT NOT NULL,
        side TEXT NOT NULL,
        price NUMERIC NOT NULL,
        amount NUMERIC NOT NULL,
        executed_amount NUMERIC NOT NULL DEFAULT 0,
        remaining_amount NUMERIC NOT NULL,
        executed_value NUMERIC NOT NULL DEFAULT 0,
        avg_executed_price NUMERIC,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CHECK (remaining_amount >= 0),
        CHECK (remaining_amount = amount - executed_amount)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)",
    "CREATE INDEX IF NOT EXISTS idx_orders_ticker_side ON orders (ticker, side)",
    r"
    CREATE TABLE IF NOT EXISTS executions (
        id BIGSERIAL PRIMARY KEY,
        order_id BIGINT NOT NULL REFERENCES orders(id),
        counter_order_id BIGINT NOT NULL REFERENCES orders(id),
        executed_price NUMERIC NOT NULL,
        executed_amount NUMERIC NOT NULL,
        executed_at TIMESTAMPTZ NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_executions_order ON executions (order_id)",
    r"
    CREATE TABLE IF NOT EXISTS waiting_orders (
        side TEXT NOT NULL,
        ticker TEXT NOT NULL,
        order_id BIGINT NOT NULL,
        price NUMERIC NOT NULL,
        PRIMARY KEY (side, ticker, order_id)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_waiting_orders_book ON waiting_orders (side, ticker, price)",
];

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> MatchResult<()> {
    info!("Running database migrations");

    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("Database migrations completed");
    Ok(())
}
