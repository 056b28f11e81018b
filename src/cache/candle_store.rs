//! In-flight candle storage.
//!
//! One current 1-minute candle per active symbol. Backed by Redis when the
//! cache is connected (hash per symbol plus an active-symbol set, written
//! through a pipeline with a TTL), otherwise by process memory. Without a
//! cross-process lock the last writer wins; a single aggregator process is
//! assumed.

use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;

use super::keys::{ttl, CacheKey};
use super::CacheError;
use crate::models::Candle;
use crate::repo::TradeTick;

enum Backend {
    Redis(ConnectionManager),
    Memory(RwLock<HashMap<String, Candle>>),
}

pub struct CandleStore {
    backend: Backend,
}

impl CandleStore {
    pub fn redis(conn: ConnectionManager) -> Self {
        Self { backend: Backend::Redis(conn) }
    }

    pub fn memory() -> Self {
        Self { backend: Backend::Memory(RwLock::new(HashMap::new())) }
    }

    pub async fn get(&self, symbol: &str) -> Result<Option<Candle>, CacheError> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.read().await.get(symbol).cloned()),
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let fields: HashMap<String, String> =
                    conn.hgetall(CacheKey::current_candle(symbol)).await?;
                if fields.is_empty() {
                    return Ok(None);
                }
                Ok(Some(parse_candle(symbol, &fields)?))
            }
        }
    }

    pub async fn set(&self, candle: &Candle) -> Result<(), CacheError> {
        match &self.backend {
            Backend::Memory(map) => {
                map.write().await.insert(candle.symbol.clone(), candle.clone());
                Ok(())
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let key = CacheKey::current_candle(&candle.symbol);
                redis::pipe()
                    .hset_multiple(
                        &key,
                        &[
                            ("symbol", candle.symbol.clone()),
                            ("open_time", candle.open_time.timestamp().to_string()),
                            ("close_time", candle.close_time.timestamp().to_string()),
                            ("open", candle.open.to_string()),
                            ("high", candle.high.to_string()),
                            ("low", candle.low.to_string()),
                            ("close", candle.close.to_string()),
                            ("volume", candle.volume.to_string()),
                        ],
                    )
                    .expire(&key, ttl::CANDLE as i64)
                    .sadd(CacheKey::active_candles(), &candle.symbol)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn has(&self, symbol: &str) -> Result<bool, CacheError> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.read().await.contains_key(symbol)),
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                Ok(conn.exists(CacheKey::current_candle(symbol)).await?)
            }
        }
    }

    /// Snapshot of every active in-flight candle.
    pub async fn all(&self) -> Result<Vec<Candle>, CacheError> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.read().await.values().cloned().collect()),
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let symbols: Vec<String> = conn.smembers(CacheKey::active_candles()).await?;
                let mut candles = Vec::with_capacity(symbols.len());
                for symbol in symbols {
                    match self.get(&symbol).await {
                        Ok(Some(candle)) => candles.push(candle),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(symbol = %symbol, error = %e, "skipping unreadable candle");
                        }
                    }
                }
                Ok(candles)
            }
        }
    }

    /// Start a fresh minute for `symbol`, carrying the previous close as the
    /// flat open/high/low/close.
    pub async fn reset(
        &self,
        symbol: &str,
        new_minute: DateTime<Utc>,
        last_close: Decimal,
    ) -> Result<(), CacheError> {
        self.set(&Candle::flat(symbol, new_minute, last_close)).await
    }

    /// Fold one executed trade into the symbol's in-flight candle, creating
    /// the candle at the trade price if none exists yet.
    pub async fn update_with_trade(
        &self,
        tick: &TradeTick,
        current_minute: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let mut candle = match self.get(&tick.symbol).await? {
            Some(candle) => candle,
            None => {
                let mut candle = Candle::flat(&tick.symbol, current_minute, tick.price);
                candle.volume = tick.quote_amount;
                return self.set(&candle).await;
            }
        };
        candle.apply_trade(tick.price, tick.quote_amount);
        self.set(&candle).await
    }

    /// Drop in-flight candles for symbols no longer active.
    pub async fn remove_stale(&self, active_symbols: &[String]) -> Result<(), CacheError> {
        match &self.backend {
            Backend::Memory(map) => {
                map.write().await.retain(|symbol, _| active_symbols.contains(symbol));
                Ok(())
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let tracked: Vec<String> = conn.smembers(CacheKey::active_candles()).await?;
                for symbol in tracked {
                    if !active_symbols.contains(&symbol) {
                        let _: () = conn.del(CacheKey::current_candle(&symbol)).await?;
                        let _: () = conn.srem(CacheKey::active_candles(), &symbol).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn parse_candle(symbol: &str, fields: &HashMap<String, String>) -> Result<Candle, CacheError> {
    let ts = |name: &str| -> Result<DateTime<Utc>, CacheError> {
        let raw = fields
            .get(name)
            .ok_or_else(|| CacheError::Corrupt(format!("missing field {}", name)))?;
        let secs: i64 = raw
            .parse()
            .map_err(|_| CacheError::Corrupt(format!("bad timestamp in {}", name)))?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| CacheError::Corrupt(format!("bad timestamp in {}", name)))
    };
    let num = |name: &str| -> Result<Decimal, CacheError> {
        let raw = fields
            .get(name)
            .ok_or_else(|| CacheError::Corrupt(format!("missing field {}", name)))?;
        Decimal::from_str(raw).map_err(|_| CacheError::Corrupt(format!("bad number in {}", name)))
    };

    Ok(Candle {
        symbol: symbol.to_string(),
        open_time: ts("open_time")?,
        close_time: ts("close_time")?,
        open: num("open")?,
        high: num("high")?,
        low: num("low")?,
        close: num("close")?,
        volume: num("volume")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, price: Decimal, quote: Decimal) -> TradeTick {
        TradeTick {
            symbol: symbol.to_string(),
            price,
            quote_amount: quote,
            trade_time: Utc::now(),
        }
    }

    fn minute() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_first_trade_creates_candle() {
        let store = CandleStore::memory();
        store
            .update_with_trade(&tick("X/USDT", dec!(10), dec!(5)), minute())
            .await
            .unwrap();

        let candle = store.get("X/USDT").await.unwrap().unwrap();
        assert_eq!(candle.open, dec!(10));
        assert_eq!(candle.high, dec!(10));
        assert_eq!(candle.low, dec!(10));
        assert_eq!(candle.close, dec!(10));
        assert_eq!(candle.volume, dec!(5));
        assert_eq!(candle.open_time, minute());
    }

    #[tokio::test]
    async fn test_memory_store_trade_updates_existing_candle() {
        let store = CandleStore::memory();
        store
            .update_with_trade(&tick("X/USDT", dec!(10), dec!(5)), minute())
            .await
            .unwrap();
        store
            .update_with_trade(&tick("X/USDT", dec!(12), dec!(1)), minute())
            .await
            .unwrap();

        let candle = store.get("X/USDT").await.unwrap().unwrap();
        assert_eq!(candle.open, dec!(10));
        assert_eq!(candle.high, dec!(12));
        assert_eq!(candle.close, dec!(12));
        assert_eq!(candle.volume, dec!(6));
    }

    #[tokio::test]
    async fn test_memory_store_reset_carries_close() {
        let store = CandleStore::memory();
        store
            .update_with_trade(&tick("X/USDT", dec!(12), dec!(6)), minute())
            .await
            .unwrap();

        let next = minute() + chrono::Duration::minutes(1);
        store.reset("X/USDT", next, dec!(12)).await.unwrap();

        let candle = store.get("X/USDT").await.unwrap().unwrap();
        assert_eq!(candle.open, dec!(12));
        assert_eq!(candle.volume, dec!(0));
        assert_eq!(candle.open_time, next);
    }

    #[tokio::test]
    async fn test_memory_store_remove_stale() {
        let store = CandleStore::memory();
        store.reset("A/USDT", minute(), dec!(1)).await.unwrap();
        store.reset("B/USDT", minute(), dec!(2)).await.unwrap();

        store.remove_stale(&["A/USDT".to_string()]).await.unwrap();
        assert!(store.has("A/USDT").await.unwrap());
        assert!(!store.has("B/USDT").await.unwrap());
    }
}
