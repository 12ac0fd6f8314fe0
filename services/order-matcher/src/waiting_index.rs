//! Waiting-order index
//!
//! Per (side, ticker) ordered membership of outstanding order ids, scored by
//! limit price. The index only answers "which ids are still outstanding";
//! prices and quantities are always re-read from the order store.

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::error::{MatchError, MatchResult};
use crate::order::{OrderId, Side};

/// Ordered set of outstanding order ids per (side, ticker)
#[async_trait]
pub trait WaitingOrderIndex: Send + Sync + fmt::Debug {
    /// Add `order_id` with `price` as its score. Re-adding an id replaces its score.
    async fn enqueue(&self, side: Side, ticker: &str, order_id: OrderId, price: Decimal) -> MatchResult<()>;

    /// All outstanding ids for (side, ticker): best price first, then lowest id
    async fn list_waiting_ids(&self, side: Side, ticker: &str) -> MatchResult<Vec<OrderId>>;

    /// Remove `order_id`. Returns whether it was present.
    async fn remove(&self, side: Side, ticker: &str, order_id: OrderId) -> MatchResult<bool>;

    /// Every ticker with at least one outstanding order on either side
    async fn list_tickers_with_activity(&self) -> MatchResult<Vec<String>>;

    /// Number of outstanding ids for (side, ticker)
    async fn len(&self, side: Side, ticker: &str) -> MatchResult<usize>;
}

/// Sort key inside one book
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    /// Price (negated for buy orders so the best bid sorts first)
    score: Decimal,
    /// Tie-break for equal prices
    order_id: OrderId,
}

impl IndexKey {
    fn new(side: Side, price: Decimal, order_id: OrderId) -> Self {
        let score = match side {
            Side::Buy => -price,
            Side::Sell => price,
        };
        Self { score, order_id }
    }
}

#[derive(Debug, Default)]
struct WaitingBook {
    ordered: BTreeSet<IndexKey>,
    members: FxHashMap<OrderId, IndexKey>,
}

/// In-process index backed by one `BTreeSet` per (side, ticker)
#[derive(Debug, Default)]
pub struct InMemoryWaitingIndex {
    books: RwLock<BTreeMap<(Side, String), WaitingBook>>,
}

impl InMemoryWaitingIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitingOrderIndex for InMemoryWaitingIndex {
    async fn enqueue(&self, side: Side, ticker: &str, order_id: OrderId, price: Decimal) -> MatchResult<()> {
        let key = IndexKey::new(side, price, order_id);
        let mut books = self.books.write();
        let book = books.entry((side, ticker.to_string())).or_default();

        if let Some(previous) = book.members.insert(order_id, key) {
            book.ordered.remove(&previous);
        }
        book.ordered.insert(key);
        Ok(())
    }

    async fn list_waiting_ids(&self, side: Side, ticker: &str) -> MatchResult<Vec<OrderId>> {
        let books = self.books.read();
        Ok(books
            .get(&(side, ticker.to_string()))
            .map(|book| book.ordered.iter().map(|key| key.order_id).collect())
            .unwrap_or_default())
    }

    async fn remove(&self, side: Side, ticker: &str, order_id: OrderId) -> MatchResult<bool> {
        let mut books = self.books.write();
        let book_key = (side, ticker.to_string());
        let Some(book) = books.get_mut(&book_key) else {
            return Ok(false);
        };

        let removed = match book.members.remove(&order_id) {
            Some(key) => book.ordered.remove(&key),
            None => false,
        };

        if book.ordered.is_empty() {
            books.remove(&book_key);
        }
        Ok(removed)
    }

    async fn list_tickers_with_activity(&self) -> MatchResult<Vec<String>> {
        let books = self.books.read();
        let tickers: BTreeSet<&String> = books.keys().map(|(_, ticker)| ticker).collect();
        Ok(tickers.into_iter().cloned().collect())
    }

    async fn len(&self, side: Side, ticker: &str) -> MatchResult<usize> {
        Ok(self
            .books
            .read()
            .get(&(side, ticker.to_string()))
            .map_or(0, |book| book.ordered.len()))
    }
}

/// `PostgreSQL` index on the `waiting_orders` table
#[derive(Debug, Clone)]
pub struct PgWaitingIndex {
    /// Database pool
    db_pool: PgPool,
}

impl PgWaitingIndex {
    /// Create new index over an existing pool
    #[must_use]
    pub const fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

fn unavailable(err: sqlx::Error) -> MatchError {
    MatchError::IndexUnavailable(err.to_string())
}

#[async_trait]
impl WaitingOrderIndex for PgWaitingIndex {
    async fn enqueue(&self, side: Side, ticker: &str, order_id: OrderId, price: Decimal) -> MatchResult<()> {
        sqlx::query(
            r"
            INSERT INTO waiting_orders (side, ticker, order_id, price)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (side, ticker, order_id) DO UPDATE SET price = EXCLUDED.price
            ",
        )
        .bind(side.as_str())
        .bind(ticker)
        .bind(order_id.0)
        .bind(price)
        .execute(&self.db_pool)
        .await
        .map_err(unavailable)?;

        debug!(order_id = %order_id, ticker, side = %side, "Order enqueued");
        Ok(())
    }

    async fn list_waiting_ids(&self, side: Side, ticker: &str) -> MatchResult<Vec<OrderId>> {
        let query = match side {
            Side::Buy => {
                r"
                SELECT order_id FROM waiting_orders
                WHERE side = $1 AND ticker = $2
                ORDER BY price DESC, order_id ASC
                "
            }
            Side::Sell => {
                r"
                SELECT order_id FROM waiting_orders
                WHERE side = $1 AND ticker = $2
                ORDER BY price ASC, order_id ASC
                "
            }
        };

        let rows = sqlx::query(query)
            .bind(side.as_str())
            .bind(ticker)
            .fetch_all(&self.db_pool)
            .await
            .map_err(unavailable)?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("order_id").map(OrderId).map_err(unavailable))
            .collect()
    }

    async fn remove(&self, side: Side, ticker: &str, order_id: OrderId) -> MatchResult<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM waiting_orders
            WHERE side = $1 AND ticker = $2 AND order_id = $3
            ",
        )
        .bind(side.as_str())
        .bind(ticker)
        .bind(order_id.0)
        .execute(&self.db_pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tickers_with_activity(&self) -> MatchResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT ticker FROM waiting_orders ORDER BY ticker")
            .fetch_all(&self.db_pool)
            .await
            .map_err(unavailable)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("ticker").map_err(unavailable))
            .collect()
    }

    async fn len(&self, side: Side, ticker: &str) -> MatchResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM waiting_orders WHERE side = $1 AND ticker = $2",
        )
        .bind(side.as_str())
        .bind(ticker)
        .fetch_one(&self.db_pool)
        .await
        .map_err(unavailable)?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}
