//! Application configuration, loaded from environment variables.

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,

    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    pub jwt_secret: String,

    /// Allowed CORS origin; `*` allows any.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,

    /// Taker fee rate; makers pay half of it.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,

    // Auth bypass for local development only.
    #[serde(default)]
    pub auth_disabled: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_acquire_timeout")]
    pub db_acquire_timeout_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_fee_rate() -> Decimal {
    // 10 bps taker / 5 bps maker
    Decimal::new(1, 3)
}

fn default_db_max_connections() -> u32 {
    50
}

fn default_db_min_connections() -> u32 {
    10
}

fn default_db_acquire_timeout() -> u64 {
    5
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    pub fn is_auth_disabled(&self) -> bool {
        self.auth_disabled
    }
}
