//! Market model

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A base/quote trading pair.
///
/// Price is quoted as quote units per base unit; for `BTC/USDT`, BTC is base
/// and USDT is quote. Everything except `is_active` is immutable while the
/// engine runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub id: Uuid,
    pub symbol: String,
    pub base_asset_id: Uuid,
    pub quote_asset_id: Uuid,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
    pub is_active: bool,
}
