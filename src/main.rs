use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod cache;
mod config;
mod db;
mod error;
mod models;
mod repo;
mod services;
mod ws;

use crate::cache::{CacheManager, CandleStore};
use crate::config::AppConfig;
use crate::db::Database;
use crate::services::candles::CandleAggregator;
use crate::services::matching::MatchingEngine;
use crate::ws::candle_hub::{CandleHub, CandleHubHandle, SymbolRegistry};
use crate::ws::orderbook_hub::{run_orderbook_broadcaster, OrderbookHub, OrderbookHubHandle};

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub engine: MatchingEngine,
    pub candle_store: Arc<CandleStore>,
    pub candle_hub: CandleHubHandle,
    pub orderbook_hub: OrderbookHubHandle,
    pub symbol_registry: SymbolRegistry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spot_exchange_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("starting spot exchange backend v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(&config).await?;
    sqlx::migrate!().run(&db.pool).await?;
    tracing::info!("database ready");

    let cache = CacheManager::connect(config.redis_url.as_deref()).await;
    if !cache.is_available() {
        tracing::warn!("running without redis; in-flight candles held in process memory");
    }
    let candle_store = Arc::new(cache.candle_store());

    let engine = MatchingEngine::new(db.pool.clone(), config.fee_rate);
    tracing::info!(fee_rate = %config.fee_rate, "matching engine initialized");

    let (candle_hub, candle_handle) = CandleHub::new();
    tokio::spawn(candle_hub.run());

    let (orderbook_hub, orderbook_handle) = OrderbookHub::new();
    tokio::spawn(orderbook_hub.run());

    let symbol_registry = SymbolRegistry::new();

    let aggregator = CandleAggregator::new(
        db.pool.clone(),
        Arc::clone(&candle_store),
        candle_handle.clone(),
        symbol_registry.clone(),
    );
    tokio::spawn(aggregator.run());

    tokio::spawn(run_orderbook_broadcaster(db.pool.clone(), orderbook_handle.clone()));

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        engine,
        candle_store,
        candle_hub: candle_handle,
        orderbook_hub: orderbook_handle,
        symbol_registry,
    });

    let cors = if config.cors_origin == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origin: HeaderValue = config.cors_origin.parse()?;
        CorsLayer::new().allow_origin(origin).allow_methods(Any).allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::routes::create_router(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<&'static str, axum::http::StatusCode> {
    if state.db.health_check().await {
        Ok("OK")
    } else {
        Err(axum::http::StatusCode::SERVICE_UNAVAILABLE)
    }
}
