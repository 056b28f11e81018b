//! Trade persistence and queries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::Trade;

/// A trade reduced to what candle aggregation needs, with the market symbol
/// resolved.
#[derive(Debug, Clone, FromRow)]
pub struct TradeTick {
    pub symbol: String,
    pub price: Decimal,
    pub quote_amount: Decimal,
    pub trade_time: DateTime<Utc>,
}

pub struct TradeRepo;

impl TradeRepo {
    pub async fn insert(conn: &mut PgConnection, trade: &mut Trade) -> Result<()> {
        let (id, trade_time): (Uuid, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO trades (market_id, maker_order_id, taker_order_id, taker_side,
                                price, amount, quote_amount, fee_maker, fee_taker)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, trade_time
            "#,
        )
        .bind(trade.market_id)
        .bind(trade.maker_order_id)
        .bind(trade.taker_order_id)
        .bind(trade.taker_side)
        .bind(trade.price)
        .bind(trade.amount)
        .bind(trade.quote_amount)
        .bind(trade.fee_maker)
        .bind(trade.fee_taker)
        .fetch_one(conn)
        .await?;

        trade.id = id;
        trade.trade_time = trade_time;
        Ok(())
    }

    /// Total quote already spent by a taker order across its trades.
    /// Used to size market-buy refunds.
    pub async fn quote_spent_by_taker(conn: &mut PgConnection, taker_order_id: Uuid) -> Result<Decimal> {
        let (sum,): (Decimal,) = sqlx::query_as(
            "SELECT COALESCE(SUM(quote_amount), 0) FROM trades WHERE taker_order_id = $1",
        )
        .bind(taker_order_id)
        .fetch_one(conn)
        .await?;
        Ok(sum)
    }

    /// Trades executed at or after `since` on active markets, oldest first,
    /// with market symbols resolved. Feeds the candle aggregator.
    pub async fn latest_since(pool: &PgPool, since: DateTime<Utc>) -> Result<Vec<TradeTick>> {
        let ticks = sqlx::query_as::<_, TradeTick>(
            r#"
            SELECT m.symbol, t.price, t.quote_amount, t.trade_time
            FROM trades t
            JOIN markets m ON m.id = t.market_id
            WHERE t.trade_time >= $1 AND m.is_active
            ORDER BY t.trade_time ASC
            "#,
        )
        .bind(since)
        .fetch_all(pool)
        .await?;
        Ok(ticks)
    }

    /// Trade history for a user (maker or taker side), newest first.
    pub async fn list_for_user(pool: &PgPool, user_id: Uuid, limit: i64) -> Result<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(
            r#"
            SELECT t.id, t.market_id, t.maker_order_id, t.taker_order_id, t.taker_side,
                   t.price, t.amount, t.quote_amount, t.fee_maker, t.fee_taker, t.trade_time
            FROM trades t
            WHERE EXISTS (
                SELECT 1 FROM orders o
                WHERE o.user_id = $1 AND o.id IN (t.maker_order_id, t.taker_order_id)
            )
            ORDER BY t.trade_time DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(trades)
    }
}
