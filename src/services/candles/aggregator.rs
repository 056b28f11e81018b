//! Live candle aggregation.
//!
//! A single task ticks every two seconds: on a minute boundary it persists
//! every finished in-flight candle and starts the next minute from its close;
//! then it folds trades committed since the last tick into the current
//! candles and hands the full set to the candle hub. One aggregator process
//! owns the in-flight candles; there is no cross-process lock on them.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::cache::CandleStore;
use crate::error::Result;
use crate::repo::{MarketRepo, TradeRepo};
use crate::ws::candle_hub::{CandleHubHandle, SymbolRegistry};

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(2);

/// Truncate a timestamp to the start of its minute.
pub fn truncate_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(60), 0).unwrap()
}

pub struct CandleAggregator {
    pool: PgPool,
    store: Arc<CandleStore>,
    hub: CandleHubHandle,
    registry: SymbolRegistry,
    current_minute: DateTime<Utc>,
    last_check: DateTime<Utc>,
}

impl CandleAggregator {
    pub fn new(
        pool: PgPool,
        store: Arc<CandleStore>,
        hub: CandleHubHandle,
        registry: SymbolRegistry,
    ) -> Self {
        let now = Utc::now();
        Self {
            pool,
            store,
            hub,
            registry,
            current_minute: truncate_minute(now),
            last_check: now,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        tracing::info!("candle aggregator started");

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "candle aggregator tick failed");
            }
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let new_minute = truncate_minute(now);
        if new_minute > self.current_minute {
            self.roll_over(new_minute).await?;
        }

        let ticks = TradeRepo::latest_since(&self.pool, self.last_check).await?;
        for tick in &ticks {
            if let Err(e) = self.store.update_with_trade(tick, self.current_minute).await {
                tracing::warn!(symbol = %tick.symbol, error = %e, "candle update failed");
            }
        }
        self.last_check = now;

        match self.store.all().await {
            Ok(candles) if !candles.is_empty() => self.hub.broadcast(candles).await,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "reading in-flight candles failed"),
        }
        Ok(())
    }

    /// Persist every finished candle, restart each from its close, and make
    /// sure every subscribed symbol enters the new minute with a candle.
    async fn roll_over(&mut self, new_minute: DateTime<Utc>) -> Result<()> {
        tracing::debug!(minute = %new_minute, "minute rollover");

        let finished = match self.store.all().await {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!(error = %e, "reading candles for rollover failed");
                Vec::new()
            }
        };

        for candle in finished {
            match MarketRepo::validate_symbol(&self.pool, &candle.symbol).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(symbol = %candle.symbol, "skipping candle for unknown market");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(symbol = %candle.symbol, error = %e, "symbol validation failed");
                    continue;
                }
            }

            if let Err(e) = MarketRepo::upsert_candle_1m(&self.pool, &candle).await {
                tracing::warn!(symbol = %candle.symbol, error = %e, "candle persist failed");
            }
            if let Err(e) = self.store.reset(&candle.symbol, new_minute, candle.close).await {
                tracing::warn!(symbol = %candle.symbol, error = %e, "candle reset failed");
            }
        }

        for symbol in self.registry.all().await {
            if let Ok(false) = self.store.has(&symbol).await {
                if let Err(e) =
                    initialize_symbol_candle(&self.pool, &self.store, &symbol, new_minute).await
                {
                    tracing::warn!(symbol = %symbol, error = %e, "candle initialization failed");
                }
            }
        }

        match MarketRepo::list_active(&self.pool).await {
            Ok(markets) => {
                let active: Vec<String> = markets.into_iter().map(|m| m.symbol).collect();
                if let Err(e) = self.store.remove_stale(&active).await {
                    tracing::warn!(error = %e, "stale candle cleanup failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to list markets for candle cleanup"),
        }

        self.current_minute = new_minute;
        Ok(())
    }
}

/// Seed an in-flight candle for a freshly subscribed symbol.
///
/// Opening price: the most recent persisted 1m close, else the last trade
/// price within 24 hours, else zero.
pub async fn initialize_symbol_candle(
    pool: &PgPool,
    store: &CandleStore,
    symbol: &str,
    minute: DateTime<Utc>,
) -> Result<()> {
    if store.has(symbol).await.unwrap_or(false) {
        return Ok(());
    }

    if let Some(last) = MarketRepo::candles_1m(pool, symbol, 1, None).await?.first() {
        let close = last.close;
        if let Err(e) = store.reset(symbol, minute, close).await {
            tracing::warn!(symbol = %symbol, error = %e, "candle seed failed");
        }
        return Ok(());
    }

    let since = Utc::now() - Duration::hours(24);
    let ticks = TradeRepo::latest_since(pool, since).await?;
    let price = ticks
        .iter()
        .rev()
        .find(|t| t.symbol == symbol)
        .map(|t| t.price)
        .unwrap_or(Decimal::ZERO);

    if let Err(e) = store.reset(symbol, minute, price).await {
        tracing::warn!(symbol = %symbol, error = %e, "candle seed failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderStatus, OrderType, TimeInForce};
    use crate::ws::candle_hub::CandleHub;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[test]
    fn test_truncate_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 58).unwrap();
        assert_eq!(truncate_minute(ts), Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let boundary = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap();
        assert_eq!(truncate_minute(boundary), boundary);
    }

    mod rollover {
        use super::*;
        use sqlx::PgPool;

        async fn seed_market(pool: &PgPool) -> Uuid {
            let (base,): (Uuid,) =
                sqlx::query_as("INSERT INTO assets (symbol) VALUES ('X') RETURNING id")
                    .fetch_one(pool)
                    .await
                    .unwrap();
            let (quote,): (Uuid,) =
                sqlx::query_as("INSERT INTO assets (symbol) VALUES ('USDT') RETURNING id")
                    .fetch_one(pool)
                    .await
                    .unwrap();
            let (market,): (Uuid,) = sqlx::query_as(
                "INSERT INTO markets (symbol, base_asset_id, quote_asset_id) \
                 VALUES ('X/USDT', $1, $2) RETURNING id",
            )
            .bind(base)
            .bind(quote)
            .fetch_one(pool)
            .await
            .unwrap();
            market
        }

        async fn seed_order(pool: &PgPool, market_id: Uuid) -> Uuid {
            let (id,): (Uuid,) = sqlx::query_as(
                "INSERT INTO orders (user_id, market_id, side, type, price, amount, status, tif) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            )
            .bind(Uuid::new_v4())
            .bind(market_id)
            .bind(OrderSide::Sell)
            .bind(OrderType::Limit)
            .bind(dec!(10))
            .bind(dec!(1))
            .bind(OrderStatus::Filled)
            .bind(TimeInForce::Gtc)
            .fetch_one(pool)
            .await
            .unwrap();
            id
        }

        async fn seed_trade(
            pool: &PgPool,
            market_id: Uuid,
            order_id: Uuid,
            price: rust_decimal::Decimal,
            quote: rust_decimal::Decimal,
            at: DateTime<Utc>,
        ) {
            sqlx::query(
                "INSERT INTO trades (market_id, maker_order_id, taker_order_id, taker_side, \
                                     price, amount, quote_amount, fee_maker, fee_taker, trade_time) \
                 VALUES ($1, $2, $2, 'buy', $3, 1, $4, 0, 0, $5)",
            )
            .bind(market_id)
            .bind(order_id)
            .bind(price)
            .bind(quote)
            .bind(at)
            .execute(pool)
            .await
            .unwrap();
        }

        fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
        }

        #[sqlx::test]
        async fn test_minute_rollover_persists_and_resets(pool: PgPool) {
            let market_id = seed_market(&pool).await;
            let order_id = seed_order(&pool, market_id).await;

            let (hub, handle) = CandleHub::new();
            tokio::spawn(hub.run());

            let mut aggregator = CandleAggregator::new(
                pool.clone(),
                Arc::new(CandleStore::memory()),
                handle,
                SymbolRegistry::new(),
            );
            aggregator.current_minute = at(12, 0, 0);
            aggregator.last_check = at(12, 0, 0);

            // Trade at 12:00:30 opens the candle.
            seed_trade(&pool, market_id, order_id, dec!(10), dec!(5), at(12, 0, 30)).await;
            aggregator.tick(at(12, 0, 32)).await.unwrap();

            let candle = aggregator.store.get("X/USDT").await.unwrap().unwrap();
            assert_eq!(candle.open, dec!(10));
            assert_eq!(candle.high, dec!(10));
            assert_eq!(candle.volume, dec!(5));

            // Second trade at 12:00:58 lifts high/close.
            seed_trade(&pool, market_id, order_id, dec!(12), dec!(1), at(12, 0, 58)).await;
            aggregator.tick(at(12, 0, 59)).await.unwrap();

            let candle = aggregator.store.get("X/USDT").await.unwrap().unwrap();
            assert_eq!(candle.high, dec!(12));
            assert_eq!(candle.close, dec!(12));
            assert_eq!(candle.volume, dec!(6));

            // First tick past 12:01 persists the finished minute and starts
            // the next one from its close.
            aggregator.tick(at(12, 1, 1)).await.unwrap();

            let (open, high, low, close, volume): (
                rust_decimal::Decimal,
                rust_decimal::Decimal,
                rust_decimal::Decimal,
                rust_decimal::Decimal,
                rust_decimal::Decimal,
            ) = sqlx::query_as(
                "SELECT open, high, low, close, volume FROM ohlcv_1m \
                 WHERE symbol = 'X/USDT' AND open_time = $1",
            )
            .bind(at(12, 0, 0))
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(open, dec!(10));
            assert_eq!(high, dec!(12));
            assert_eq!(low, dec!(10));
            assert_eq!(close, dec!(12));
            assert_eq!(volume, dec!(6));

            let fresh = aggregator.store.get("X/USDT").await.unwrap().unwrap();
            assert_eq!(fresh.open_time, at(12, 1, 0));
            assert_eq!(fresh.open, dec!(12));
            assert_eq!(fresh.high, dec!(12));
            assert_eq!(fresh.low, dec!(12));
            assert_eq!(fresh.close, dec!(12));
            assert_eq!(fresh.volume, dec!(0));
        }

        #[sqlx::test]
        async fn test_initialize_symbol_from_persisted_close(pool: PgPool) {
            seed_market(&pool).await;
            let store = CandleStore::memory();

            sqlx::query(
                "INSERT INTO ohlcv_1m (symbol, open_time, close_time, open, high, low, close, volume) \
                 VALUES ('X/USDT', $1, $2, 9, 11, 9, 10.5, 3)",
            )
            .bind(at(11, 58, 0))
            .bind(at(11, 59, 0))
            .execute(&pool)
            .await
            .unwrap();

            initialize_symbol_candle(&pool, &store, "X/USDT", at(12, 0, 0)).await.unwrap();

            let candle = store.get("X/USDT").await.unwrap().unwrap();
            assert_eq!(candle.open, dec!(10.5));
            assert_eq!(candle.volume, dec!(0));
        }

        #[sqlx::test]
        async fn test_initialize_symbol_without_history_opens_at_zero(pool: PgPool) {
            seed_market(&pool).await;
            let store = CandleStore::memory();

            initialize_symbol_candle(&pool, &store, "X/USDT", at(12, 0, 0)).await.unwrap();

            let candle = store.get("X/USDT").await.unwrap().unwrap();
            assert_eq!(candle.open, Decimal::ZERO);
        }
    }
}
