use crate::errors::{Error, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://telemetry.db";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

/// Process configuration, read once from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub secret: String,
    pub database_url: String,
    pub http_addr: String,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't touch
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("GATEWAY_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("GATEWAY_SECRET must be set".to_string()))?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let http_addr = lookup("HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());

        let request_timeout_ms: u64 =
            parse_or(&lookup, "REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;
        let max_body_bytes = parse_or(&lookup, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;
        let db_max_connections =
            parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;

        if db_max_connections == 0 {
            return Err(Error::Config(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            secret,
            database_url,
            http_addr,
            request_timeout: Duration::from_millis(request_timeout_ms),
            max_body_bytes,
            db_max_connections,
        })
    }

    /// Database URL with any credentials removed, for logging.
    pub fn redacted_database_url(&self) -> &str {
        self.database_url
            .rsplit('@')
            .next()
            .unwrap_or(&self.database_url)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("secret", &"***")
            .field("database_url", &self.redacted_database_url())
            .field("http_addr", &self.http_addr)
            .field("request_timeout", &self.request_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("db_max_connections", &self.db_max_connections)
            .finish()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{} has invalid value {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
