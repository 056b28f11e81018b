//! Trade model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::order::OrderSide;

/// An executed match. Append-only; immutable once inserted.
///
/// `price` is always the maker's price, `quote_amount = price * amount`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub market_id: Uuid,
    pub maker_order_id: Uuid,
    pub taker_order_id: Uuid,
    pub taker_side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub quote_amount: Decimal,
    pub fee_maker: Decimal,
    pub fee_taker: Decimal,
    pub trade_time: DateTime<Utc>,
}
