//! Market metadata and 1-minute candle persistence.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Candle, Market};

pub struct MarketRepo;

impl MarketRepo {
    pub async fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Market> {
        sqlx::query_as::<_, Market>(
            r#"
            SELECT id, symbol, base_asset_id, quote_asset_id,
                   min_price, max_price, tick_size, min_notional, is_active
            FROM markets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(EngineError::NotFound("market"))
    }

    pub async fn list_active(pool: &PgPool) -> Result<Vec<Market>> {
        let markets = sqlx::query_as::<_, Market>(
            r#"
            SELECT id, symbol, base_asset_id, quote_asset_id,
                   min_price, max_price, tick_size, min_notional, is_active
            FROM markets
            WHERE is_active
            ORDER BY symbol
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(markets)
    }

    /// Whether `symbol` names an active market.
    pub async fn validate_symbol(pool: &PgPool, symbol: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM markets WHERE symbol = $1 AND is_active)",
        )
        .bind(symbol)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    /// 1-minute candles, newest first, optionally bounded by
    /// `open_time < end_time`.
    pub async fn candles_1m(
        pool: &PgPool,
        symbol: &str,
        limit: i64,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let candles = sqlx::query_as::<_, Candle>(
            r#"
            SELECT symbol, open_time, close_time, open, high, low, close, volume
            FROM ohlcv_1m
            WHERE symbol = $1 AND ($2::timestamptz IS NULL OR open_time < $2)
            ORDER BY open_time DESC
            LIMIT $3
            "#,
        )
        .bind(symbol)
        .bind(end_time)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(candles)
    }

    /// Persist a completed 1-minute candle. Re-persisting the same
    /// `(symbol, open_time)` overwrites high/low/close/close_time/volume.
    pub async fn upsert_candle_1m(pool: &PgPool, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ohlcv_1m (symbol, open_time, close_time, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (symbol, open_time) DO UPDATE
            SET close_time = EXCLUDED.close_time,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.open_time)
        .bind(candle.close_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(pool)
        .await?;
        Ok(())
    }
}
