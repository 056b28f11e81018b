//! OHLCV candle model

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A candlestick over a fixed window, volume in quote units.
///
/// Persisted rows are always one minute wide and keyed by
/// `(symbol, open_time)`; wider intervals exist only as in-memory
/// aggregations of 1m rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// A flat one-minute candle opening at `minute` with all prices at
    /// `price` and zero volume.
    pub fn flat(symbol: &str, minute: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            open_time: minute,
            close_time: minute + Duration::minutes(1),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
        }
    }

    /// Fold one executed trade into this candle.
    pub fn apply_trade(&mut self, price: Decimal, quote_amount: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += quote_amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_flat_candle() {
        let minute = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let c = Candle::flat("BTC/USDT", minute, dec!(100));
        assert_eq!(c.open, dec!(100));
        assert_eq!(c.high, dec!(100));
        assert_eq!(c.low, dec!(100));
        assert_eq!(c.close, dec!(100));
        assert_eq!(c.volume, dec!(0));
        assert_eq!(c.close_time - c.open_time, Duration::minutes(1));
    }

    #[test]
    fn test_apply_trade_updates_hlcv() {
        let minute = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut c = Candle::flat("BTC/USDT", minute, dec!(10));
        c.apply_trade(dec!(12), dec!(1));
        assert_eq!(c.open, dec!(10));
        assert_eq!(c.high, dec!(12));
        assert_eq!(c.low, dec!(10));
        assert_eq!(c.close, dec!(12));
        assert_eq!(c.volume, dec!(1));

        c.apply_trade(dec!(8), dec!(2));
        assert_eq!(c.high, dec!(12));
        assert_eq!(c.low, dec!(8));
        assert_eq!(c.close, dec!(8));
        assert_eq!(c.volume, dec!(3));
    }
}
