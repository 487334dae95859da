// Gateway server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every variable carries the `CARECHAT_GATEWAY_` prefix.

use std::net::SocketAddr;

use crate::db::pool::PoolConfig;

pub const DEV_JWT_SECRET: &str = "carechat_local_development_jwt_secret_must_be_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Plain
        }
    }
}

/// Core gateway configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the token issuer.
    pub jwt_secret: String,
    /// PostgreSQL connection string. Required to start the server.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `carechat_gateway=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub pool: PoolConfig,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CARECHAT_GATEWAY_HOST` | `0.0.0.0` |
    /// | `CARECHAT_GATEWAY_PORT` | `8080` |
    /// | `CARECHAT_GATEWAY_JWT_SECRET` | dev-only placeholder |
    /// | `CARECHAT_GATEWAY_DATABASE_URL` | *(none)* |
    /// | `CARECHAT_GATEWAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `CARECHAT_GATEWAY_LOG_FILTER` | `info` |
    /// | `CARECHAT_GATEWAY_LOG_FORMAT` | `plain` |
    /// | `CARECHAT_GATEWAY_DB_MIN_CONNECTIONS` | `2` |
    /// | `CARECHAT_GATEWAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `CARECHAT_GATEWAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CARECHAT_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CARECHAT_GATEWAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("CARECHAT_GATEWAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("CARECHAT_GATEWAY_DATABASE_URL").ok();
        let cors_origins = env("CARECHAT_GATEWAY_CORS_ORIGINS").ok();

        let log_filter = env("CARECHAT_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = env("CARECHAT_GATEWAY_LOG_FORMAT")
            .map(|value| LogFormat::parse(&value))
            .unwrap_or(LogFormat::Plain);

        let pool = PoolConfig::from_env_fn(&env);

        Self { listen_addr, jwt_secret, database_url, cors_origins, log_filter, log_format, pool }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
