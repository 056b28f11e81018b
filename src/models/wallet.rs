//! Wallet model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-(user, asset) balance row.
///
/// `balance` is free and spendable; `in_orders` is reserved by open orders.
/// Both stay non-negative after every committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub balance: Decimal,
    pub in_orders: Decimal,
    pub updated_at: DateTime<Utc>,
}
