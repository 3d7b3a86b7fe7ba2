//! Environment-driven configuration. Every key has a default so the
//! service starts unconfigured against a local database.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
        }
    }
}

/// Database connection parameters.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Passed through to the driver: disable, prefer, require, ...
    pub sslmode: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "ctuser".to_string(),
            password: "password".to_string(),
            database: "scrapeNPM".to_string(),
            sslmode: "disable".to_string(),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("DB_HOST", defaults.host),
            port: env_parsed_or("DB_PORT", defaults.port),
            user: env_or("DB_USER", defaults.user),
            password: env_or("DB_PASSWORD", defaults.password),
            database: env_or("DB_NAME", defaults.database),
            sslmode: env_or("DB_SSLMODE", defaults.sslmode),
        }
    }

    /// Driver connect options. A malformed sslmode is the one value that
    /// cannot fall back silently; it is a startup error.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let ssl_mode = PgSslMode::from_str(&self.sslmode)?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode))
    }
}

fn env_or(key: &str, fallback: String) -> String {
    std::env::var(key).unwrap_or(fallback)
}

fn env_parsed_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}
