//! Candle intervals and in-memory aggregation of 1-minute rows.
//!
//! Only 1-minute candles are persisted; every wider interval is assembled on
//! demand from its constituent 1m rows, bucketed on interval-aligned
//! boundaries.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::PgPool;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::models::Candle;
use crate::repo::MarketRepo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleInterval {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl CandleInterval {
    /// Width in minutes; also the number of 1m rows per bucket.
    pub fn minutes(&self) -> i64 {
        match self {
            CandleInterval::M1 => 1,
            CandleInterval::M5 => 5,
            CandleInterval::M15 => 15,
            CandleInterval::H1 => 60,
            CandleInterval::H4 => 240,
            CandleInterval::D1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }
}

impl FromStr for CandleInterval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1m" => Ok(CandleInterval::M1),
            "5m" => Ok(CandleInterval::M5),
            "15m" => Ok(CandleInterval::M15),
            "1h" => Ok(CandleInterval::H1),
            "4h" => Ok(CandleInterval::H4),
            "1D" | "1d" => Ok(CandleInterval::D1),
            _ => Err(format!("invalid interval: {}", s)),
        }
    }
}

/// Truncate a timestamp to the start of its interval bucket.
pub fn bucket_start(ts: DateTime<Utc>, interval: CandleInterval) -> DateTime<Utc> {
    let width = interval.minutes() * 60;
    let secs = ts.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(width), 0).unwrap()
}

/// Fold 1-minute rows (given newest-first, as the repo returns them) into
/// interval buckets. Result is newest-first.
///
/// Per bucket: open = first row's open, close = last row's close,
/// high = max(high), low = min(low), volume = sum(volume).
pub fn aggregate_1m(rows: &[Candle], interval: CandleInterval) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();

    for row in rows.iter().rev() {
        let bucket = bucket_start(row.open_time, interval);
        match out.last_mut() {
            Some(candle) if candle.open_time == bucket => {
                candle.high = candle.high.max(row.high);
                candle.low = candle.low.min(row.low);
                candle.close = row.close;
                candle.volume += row.volume;
            }
            _ => out.push(Candle {
                symbol: row.symbol.clone(),
                open_time: bucket,
                close_time: bucket + interval.duration(),
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            }),
        }
    }

    out.reverse();
    out
}

/// Historical candles for a symbol, newest-first.
///
/// 1m is served straight from the store; wider intervals fetch
/// `limit * factor` 1m rows and aggregate them in memory.
pub async fn get_candles(
    pool: &PgPool,
    symbol: &str,
    interval: CandleInterval,
    limit: i64,
    end_time: Option<DateTime<Utc>>,
) -> Result<Vec<Candle>> {
    if limit <= 0 {
        return Err(EngineError::bad_request("limit must be > 0"));
    }

    if interval == CandleInterval::M1 {
        return MarketRepo::candles_1m(pool, symbol, limit, end_time).await;
    }

    let rows = MarketRepo::candles_1m(pool, symbol, limit * interval.minutes(), end_time).await?;
    let mut aggregated = aggregate_1m(&rows, interval);
    aggregated.truncate(limit as usize);
    Ok(aggregated)
}
