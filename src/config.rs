// src/config.rs

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

/// Default lifetime of a cached question pool (one day).
pub const DEFAULT_POOL_TTL_SECS: u64 = 24 * 60 * 60;

/// Default lifetime of cached topic metadata.
pub const DEFAULT_TOPIC_TTL_SECS: u64 = 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Which cache backs the question pools when no Redis URL is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    None,
}

impl FromStr for CacheBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheBackend::Memory),
            "none" | "off" | "noop" => Ok(CacheBackend::None),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub rust_log: String,
    pub redis_url: Option<String>,
    pub cache_backend: CacheBackend,
    pub pool_ttl: Duration,
    pub topic_ttl: Duration,
    /// Schema-compatibility toggle; resolved once here and handed to the session manager.
    pub track_attempts: bool,
    pub bind_addr: SocketAddr,
    pub log_dir: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty());

        let cache_backend = parsed("CACHE_BACKEND", CacheBackend::Memory)?;
        let pool_ttl = Duration::from_secs(parsed("POOL_CACHE_TTL_SECS", DEFAULT_POOL_TTL_SECS)?);
        let topic_ttl =
            Duration::from_secs(parsed("TOPIC_CACHE_TTL_SECS", DEFAULT_TOPIC_TTL_SECS)?);
        let track_attempts = parsed("EXAM_TRACK_ATTEMPTS", true)?;
        let bind_addr = parsed("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());

        Ok(Self {
            database_url,
            jwt_secret,
            rust_log,
            redis_url,
            cache_backend,
            pool_ttl,
            topic_ttl,
            track_attempts,
            bind_addr,
            log_dir,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
