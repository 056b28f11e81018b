//! Cache module
//!
//! Redis-backed caching with graceful degradation: when Redis is absent or
//! unreachable the service keeps running and the candle path falls back to
//! process memory.

pub mod candle_store;
pub mod keys;

pub use candle_store::CandleStore;

use redis::aio::ConnectionManager;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Owns the (optional) Redis connection and hands out cache views.
pub struct CacheManager {
    conn: Option<ConnectionManager>,
}

impl CacheManager {
    /// Connect to Redis if a URL is configured; degrade to a disabled cache
    /// on any failure.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(url) = redis_url else {
            tracing::info!("no redis url configured, cache disabled");
            return Self { conn: None };
        };

        let conn = match redis::Client::open(url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    tracing::info!(url, "cache connected");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "redis unreachable, running without cache");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(url, error = %e, "invalid redis url, running without cache");
                None
            }
        };

        Self { conn }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    /// The in-flight candle store: Redis-backed when connected, otherwise in
    /// process memory. Build once at startup so the memory fallback keeps its
    /// state.
    pub fn candle_store(&self) -> CandleStore {
        match &self.conn {
            Some(conn) => CandleStore::redis(conn.clone()),
            None => CandleStore::memory(),
        }
    }
}
