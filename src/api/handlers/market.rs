//! Market API handlers: market listing and historical candles.

use axum::extract::{Query, State};
use axum::Json;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::models::Candle;
use crate::repo::MarketRepo;
use crate::services::candles;
use crate::AppState;

/// `GET /markets`
pub async fn list_markets(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let markets = MarketRepo::list_active(&state.db.pool).await?;
    Ok(Json(json!(markets)))
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub symbol: String,
    pub interval: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(rename = "endTime")]
    pub end_time: Option<String>,
}

fn default_limit() -> i64 {
    500
}

#[derive(Debug, Serialize)]
pub struct CandlesResponse {
    pub candles: Vec<Candle>,
}

/// `GET /markets/candles?symbol=&interval=&limit=&endTime=`
pub async fn get_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandlesQuery>,
) -> Result<Json<CandlesResponse>> {
    let interval = query
        .interval
        .parse()
        .map_err(|e: String| EngineError::bad_request(e))?;

    let end_time = match &query.end_time {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| EngineError::bad_request("invalid endTime format, use RFC3339"))?
                .to_utc(),
        ),
        None => None,
    };

    let candles =
        candles::get_candles(&state.db.pool, &query.symbol, interval, query.limit, end_time).await?;
    Ok(Json(CandlesResponse { candles }))
}
