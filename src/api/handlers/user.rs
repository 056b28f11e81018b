//! User account handlers: balances and trade history.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::auth::UserContext;
use crate::error::Result;
use crate::repo::{TradeRepo, WalletRepo};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub available: Decimal,
    pub in_orders: Decimal,
}

/// `GET /user/balance`: per-asset `{available, inOrders}` map.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
) -> Result<Json<BTreeMap<String, BalanceEntry>>> {
    let rows = WalletRepo::list_for_user(&state.db.pool, user.id).await?;
    let balances = rows
        .into_iter()
        .map(|(symbol, balance, in_orders)| {
            (symbol, BalanceEntry { available: balance, in_orders })
        })
        .collect();
    Ok(Json(balances))
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /user/trades?limit=`
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<TradesQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.clamp(1, 500);
    let trades = TradeRepo::list_for_user(&state.db.pool, user.id, limit).await?;
    Ok(Json(json!(trades)))
}
