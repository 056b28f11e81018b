//! Order API handlers.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::UserContext;
use crate::error::{EngineError, Result};
use crate::models::OrderStatus;
use crate::services::matching::{AmendRequest, PlaceOrderRequest};
use crate::AppState;

/// `POST /orders`
pub async fn place_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<Json<Value>> {
    let (order, trades) = state.engine.place_order(user.id, req).await?;
    Ok(Json(json!({ "order": order, "trades": trades })))
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
}

/// `GET /orders?status=`
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Value>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<OrderStatus>()
                .map_err(EngineError::BadRequest)?,
        ),
    };

    let orders = state.engine.list_orders(user.id, status).await?;
    Ok(Json(json!(orders)))
}

/// `PUT /orders/:id`
pub async fn amend_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<AmendRequest>,
) -> Result<Json<Value>> {
    let order = state.engine.amend_order(user.id, order_id, req).await?;
    Ok(Json(json!({ "order": order })))
}

/// `DELETE /orders/:id`
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Value>> {
    state.engine.cancel_order(user.id, order_id).await?;
    Ok(Json(json!({ "status": "canceled" })))
}
