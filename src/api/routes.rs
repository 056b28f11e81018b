use axum::{
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::auth::middleware::auth_middleware;
use crate::ws::{candle_hub, orderbook_hub};
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/markets", get(handlers::market::list_markets))
        .route("/markets/candles", get(handlers::market::get_candles));

    // Protected routes (bearer token required)
    let protected_routes = Router::new()
        .route(
            "/orders",
            post(handlers::order::place_order).get(handlers::order::list_orders),
        )
        .route(
            "/orders/:id",
            put(handlers::order::amend_order).delete(handlers::order::cancel_order),
        )
        .route("/user/balance", get(handlers::user::get_balance))
        .route("/user/trades", get(handlers::user::get_trades))
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth_middleware));

    let ws_routes = Router::new()
        .route("/ws/candles", get(candle_hub::candles_ws))
        .route("/ws/orderbook", get(orderbook_hub::orderbook_ws));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
}
