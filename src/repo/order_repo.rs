//! Order persistence: the resting book, row locking and fill updates.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Order, OrderSide, OrderStatus, OrderType, OrderWithSymbol};

const ORDER_COLUMNS: &str = "id, user_id, market_id, side, type, price, amount, filled_amount, \
                             quote_amount_max, status, fee, tif, created_at, updated_at, canceled_at";

/// Aggregated amount resting at one price.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Depth-aggregated book for one market: bids descending, asks ascending.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBook {
    pub market_id: Uuid,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

pub struct OrderRepo;

impl OrderRepo {
    pub async fn insert(conn: &mut PgConnection, order: &mut Order) -> Result<()> {
        let (id, created_at, updated_at): (
            Uuid,
            chrono::DateTime<chrono::Utc>,
            chrono::DateTime<chrono::Utc>,
        ) = sqlx::query_as(
            r#"
            INSERT INTO orders (user_id, market_id, side, type, price, amount,
                                filled_amount, quote_amount_max, status, fee, tif)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, created_at, updated_at
            "#,
        )
        .bind(order.user_id)
        .bind(order.market_id)
        .bind(order.side)
        .bind(order.order_type)
        .bind(order.price)
        .bind(order.amount)
        .bind(order.filled_amount)
        .bind(order.quote_amount_max)
        .bind(order.status)
        .bind(order.fee)
        .bind(order.tif)
        .fetch_one(conn)
        .await?;

        order.id = id;
        order.created_at = created_at;
        order.updated_at = updated_at;
        Ok(())
    }

    pub async fn get_by_id_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(EngineError::NotFound("order"))
    }

    pub async fn update_fill(
        conn: &mut PgConnection,
        id: Uuid,
        filled_amount: Decimal,
        status: OrderStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE orders SET filled_amount = $2, status = $3, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(filled_amount)
            .bind(status)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Accumulate a fee charged by one trade onto the order row.
    pub async fn add_fee(conn: &mut PgConnection, id: Uuid, fee_delta: Decimal) -> Result<()> {
        sqlx::query("UPDATE orders SET fee = fee + $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(fee_delta)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Write back the total base bought by a finalized market buy.
    pub async fn set_amount(conn: &mut PgConnection, id: Uuid, amount: Decimal) -> Result<()> {
        sqlx::query("UPDATE orders SET amount = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(amount)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Amend price and amount in one statement.
    pub async fn set_price_amount(
        conn: &mut PgConnection,
        id: Uuid,
        price: Option<Decimal>,
        amount: Decimal,
    ) -> Result<()> {
        sqlx::query("UPDATE orders SET price = $2, amount = $3, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(price)
            .bind(amount)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn cancel(conn: &mut PgConnection, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET status = 'canceled', canceled_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Best resting price on the side opposite `taker_side`, without locking.
    /// Drives the POST_ONLY precheck.
    pub async fn best_opposite_price(
        conn: &mut PgConnection,
        market_id: Uuid,
        taker_side: OrderSide,
    ) -> Result<Option<Decimal>> {
        let query = match taker_side {
            OrderSide::Buy => {
                r#"
                SELECT price FROM orders
                WHERE market_id = $1 AND side = 'sell' AND type = 'limit'
                  AND status IN ('open', 'partially_filled')
                ORDER BY price ASC, created_at ASC
                LIMIT 1
                "#
            }
            OrderSide::Sell => {
                r#"
                SELECT price FROM orders
                WHERE market_id = $1 AND side = 'buy' AND type = 'limit'
                  AND status IN ('open', 'partially_filled')
                ORDER BY price DESC, created_at ASC
                LIMIT 1
                "#
            }
        };

        let row: Option<(Decimal,)> = sqlx::query_as(query).bind(market_id).fetch_optional(conn).await?;
        Ok(row.map(|(p,)| p))
    }

    /// Lock up to `limit` opposite-side limit makers in price-time priority,
    /// skipping rows already locked by concurrent takers.
    ///
    /// Market takers pass no price and the price predicate short-circuits.
    pub async fn select_makers_for_update(
        conn: &mut PgConnection,
        market_id: Uuid,
        taker_side: OrderSide,
        taker_type: OrderType,
        taker_price: Option<Decimal>,
        limit: i64,
    ) -> Result<Vec<Order>> {
        let query = match taker_side {
            OrderSide::Buy => format!(
                r#"
                SELECT {ORDER_COLUMNS}
                FROM orders
                WHERE market_id = $1 AND side = 'sell' AND type = 'limit'
                  AND status IN ('open', 'partially_filled')
                  AND ($2 = 'market' OR price <= $3)
                ORDER BY price ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $4
                "#
            ),
            OrderSide::Sell => format!(
                r#"
                SELECT {ORDER_COLUMNS}
                FROM orders
                WHERE market_id = $1 AND side = 'buy' AND type = 'limit'
                  AND status IN ('open', 'partially_filled')
                  AND ($2 = 'market' OR price >= $3)
                ORDER BY price DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $4
                "#
            ),
        };

        let makers = sqlx::query_as::<_, Order>(&query)
            .bind(market_id)
            .bind(taker_type)
            .bind(taker_price.unwrap_or(Decimal::ZERO))
            .bind(limit)
            .fetch_all(conn)
            .await?;
        Ok(makers)
    }

    /// Matchable liquidity opposite `taker_side`, as (base, notional) sums.
    /// Sized without locks; drives the all-or-nothing check for FOK takers.
    pub async fn available_liquidity(
        conn: &mut PgConnection,
        market_id: Uuid,
        taker_side: OrderSide,
        taker_type: OrderType,
        taker_price: Option<Decimal>,
    ) -> Result<(Decimal, Decimal)> {
        let maker_side = taker_side.opposite();
        let (base, notional): (Decimal, Decimal) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount - filled_amount), 0),
                   COALESCE(SUM((amount - filled_amount) * price), 0)
            FROM orders
            WHERE market_id = $1 AND side = $2 AND type = 'limit'
              AND status IN ('open', 'partially_filled')
              AND ($3 = 'market'
                   OR CASE WHEN $2 = 'sell' THEN price <= $4 ELSE price >= $4 END)
            "#,
        )
        .bind(market_id)
        .bind(maker_side)
        .bind(taker_type)
        .bind(taker_price.unwrap_or(Decimal::ZERO))
        .fetch_one(conn)
        .await?;
        Ok((base, notional))
    }

    /// Aggregate the resting book by price level.
    ///
    /// Only GTC/POST_ONLY limit orders count; level amount is
    /// `SUM(amount - filled_amount)`. Asks ascend, bids descend, each
    /// truncated to `depth`.
    pub async fn get_order_book(pool: &PgPool, market_id: Uuid, depth: i64) -> Result<OrderBook> {
        let asks = sqlx::query_as::<_, PriceLevel>(
            r#"
            SELECT price, SUM(amount - filled_amount) AS amount
            FROM orders
            WHERE market_id = $1 AND side = 'sell' AND type = 'limit'
              AND status IN ('open', 'partially_filled')
              AND tif IN ('GTC', 'POST_ONLY')
              AND price IS NOT NULL
            GROUP BY price
            ORDER BY price ASC
            LIMIT $2
            "#,
        )
        .bind(market_id)
        .bind(depth)
        .fetch_all(pool)
        .await?;

        let bids = sqlx::query_as::<_, PriceLevel>(
            r#"
            SELECT price, SUM(amount - filled_amount) AS amount
            FROM orders
            WHERE market_id = $1 AND side = 'buy' AND type = 'limit'
              AND status IN ('open', 'partially_filled')
              AND tif IN ('GTC', 'POST_ONLY')
              AND price IS NOT NULL
            GROUP BY price
            ORDER BY price DESC
            LIMIT $2
            "#,
        )
        .bind(market_id)
        .bind(depth)
        .fetch_all(pool)
        .await?;

        Ok(OrderBook { market_id, bids, asks })
    }

    /// Orders of one user joined with the market symbol, newest first,
    /// optionally filtered by status.
    pub async fn list_for_user(
        pool: &PgPool,
        user_id: Uuid,
        status: Option<OrderStatus>,
    ) -> Result<Vec<OrderWithSymbol>> {
        let orders = sqlx::query_as::<_, OrderWithSymbol>(
            r#"
            SELECT o.id, o.user_id, o.market_id, o.side, o.type, o.price, o.amount,
                   o.filled_amount, o.quote_amount_max, o.status, o.fee, o.tif,
                   o.created_at, o.updated_at, o.canceled_at, m.symbol
            FROM orders o
            JOIN markets m ON m.id = o.market_id
            WHERE o.user_id = $1 AND ($2::order_status IS NULL OR o.status = $2)
            ORDER BY o.created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(status)
        .fetch_all(pool)
        .await?;
        Ok(orders)
    }
}
