//! Engine request types and numeric thresholds.

use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{OrderSide, OrderType, TimeInForce};

/// How many makers each match-loop round locks at most. Large takers keep
/// iterating until the remainder is exhausted or the book empties.
pub const MATCH_BATCH: i64 = 50;

/// Threshold below which a base-unit remainder counts as zero.
pub fn eps_base() -> Decimal {
    Decimal::new(1, 12)
}

/// Threshold below which a quote-unit remainder counts as zero.
pub fn eps_quote() -> Decimal {
    Decimal::new(1, 8)
}

/// Body of `POST /orders`.
///
/// `amount` is required for everything except a market buy, which instead
/// carries `quote_amount_max` (the quote budget to spend).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub market_id: Uuid,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub quote_amount_max: Option<Decimal>,
    #[serde(default)]
    pub tif: TimeInForce,
}

impl PlaceOrderRequest {
    pub fn is_market_buy(&self) -> bool {
        self.order_type == OrderType::Market && self.side == OrderSide::Buy
    }
}

/// Body of `PUT /orders/:id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmendRequest {
    pub price: Option<Decimal>,
    pub amount: Decimal,
}
