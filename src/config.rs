//! Configuration: built-in defaults, overlaid by a TOML file, overlaid by
//! environment variables of the same name (§6). Grounded on the original
//! service's `config.New`, generalized to also read the environment the way
//! a twelve-factor deployment expects.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "HOST")]
    pub host: String,
    #[serde(rename = "PORT")]
    pub port: u16,
    #[serde(rename = "DATABASE_URL")]
    pub database_url: String,
    #[serde(rename = "MAX_DB_SESSIONS")]
    pub max_db_sessions: u32,
    #[serde(rename = "MAX_DB_SESSION_IDLE_TIME")]
    pub max_db_session_idle_time: u64,
    #[serde(rename = "DB_READ_TIMEOUT")]
    pub db_read_timeout: u64,
    #[serde(rename = "DB_WRITE_TIMEOUT")]
    pub db_write_timeout: u64,
    #[serde(rename = "HTTP_READ_TIMEOUT")]
    pub http_read_timeout: u64,
    #[serde(rename = "HTTP_WRITE_TIMEOUT")]
    pub http_write_timeout: u64,
    #[serde(rename = "HTTP_SHUTDOWN_TIMEOUT")]
    pub http_shutdown_timeout: u64,
    #[serde(rename = "RATE_LIMIT")]
    pub rate_limit: f64,
    #[serde(rename = "RATE_LIMIT_BURST")]
    pub rate_limit_burst: u32,
    #[serde(rename = "MAX_UPDATE_SIZE")]
    pub max_update_size_mb: u64,
    #[serde(rename = "MAX_VERSION_COUNT")]
    pub max_version_count: u32,
    #[serde(rename = "MIN_VERSION_AGE")]
    pub min_version_age: u32,
    #[serde(rename = "TOKENS_READ")]
    pub tokens_read: Vec<String>,
    #[serde(rename = "TOKENS_WRITE")]
    pub tokens_write: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: String::new(),
            max_db_sessions: 50,
            max_db_session_idle_time: 50,
            db_read_timeout: 10,
            db_write_timeout: 5,
            http_read_timeout: 15,
            http_write_timeout: 10,
            http_shutdown_timeout: 10,
            rate_limit: 10_000.0,
            rate_limit_burst: 20_000,
            max_update_size_mb: 200,
            max_version_count: 30,
            min_version_age: 20,
            tokens_read: Vec::new(),
            tokens_write: Vec::new(),
        }
    }
}

const ENV_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "DATABASE_URL",
    "MAX_DB_SESSIONS",
    "MAX_DB_SESSION_IDLE_TIME",
    "DB_READ_TIMEOUT",
    "DB_WRITE_TIMEOUT",
    "HTTP_READ_TIMEOUT",
    "HTTP_WRITE_TIMEOUT",
    "HTTP_SHUTDOWN_TIMEOUT",
    "RATE_LIMIT",
    "RATE_LIMIT_BURST",
    "MAX_UPDATE_SIZE",
    "MAX_VERSION_COUNT",
    "MIN_VERSION_AGE",
    "TOKENS_READ",
    "TOKENS_WRITE",
];

impl Config {
    /// Resolution order: built-in defaults, overlaid by `config_path` (a TOML
    /// file) if given, overlaid by process environment variables of the same
    /// name. List-valued keys (`TOKENS_READ`/`TOKENS_WRITE`) are
    /// comma-separated when they come from the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut value = toml::Value::try_from(Config::default())
            .map_err(|e| Error::Internal(format!("failed to seed default config: {e}")))?;

        if let Some(path) = config_path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::InvalidArgument(format!("failed to read config file {}: {e}", path.display())))?;
            let file_value: toml::Value = toml::from_str(&text)
                .map_err(|e| Error::InvalidArgument(format!("failed to parse config file {}: {e}", path.display())))?;
            merge_toml(&mut value, file_value);
        }

        if let toml::Value::Table(table) = &mut value {
            for key in ENV_KEYS {
                if let Ok(raw) = std::env::var(key) {
                    table.insert((*key).to_string(), env_value(key, &raw));
                }
            }
        }

        let config: Config = value
            .try_into()
            .map_err(|e| Error::InvalidArgument(format!("invalid configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::InvalidArgument("DATABASE_URL must not be empty".into()));
        }
        if self.tokens_read.is_empty() && self.tokens_write.is_empty() {
            return Err(Error::InvalidArgument("TOKENS_READ and TOKENS_WRITE must not both be empty".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("invalid HOST/PORT: {e}")))
    }

    pub fn read_tokens(&self) -> HashSet<String> {
        self.tokens_read.iter().cloned().collect()
    }

    pub fn write_tokens(&self) -> HashSet<String> {
        self.tokens_write.iter().cloned().collect()
    }
}

fn env_value(key: &str, raw: &str) -> toml::Value {
    if key == "TOKENS_READ" || key == "TOKENS_WRITE" {
        toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        )
    } else if let Ok(n) = raw.parse::<i64>() {
        toml::Value::Integer(n)
    } else if let Ok(f) = raw.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(raw.to_string())
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    if let (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) = (base, overlay) {
        for (key, value) in overlay_table {
            base_table.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_service() {
        let c = Config::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.max_version_count, 30);
        assert_eq!(c.min_version_age, 20);
    }

    #[test]
    fn validate_rejects_empty_database_url() {
        let mut c = Config::default();
        c.tokens_read.push("x".into());
        assert!(c.validate().is_err());
        c.database_url = "postgres://localhost/updsrv".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_token_sets() {
        let mut c = Config::default();
        c.database_url = "postgres://localhost/updsrv".into();
        assert!(c.validate().is_err());
    }
}
