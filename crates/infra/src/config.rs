//! Process configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

pub use procura_observability::LogFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    LogFormat(#[from] procura_observability::UnknownLogFormat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres URL; without one the in-memory store is used.
    pub database_url: Option<String>,
    pub export_max_rows: usize,
    pub batch_chunk_size: usize,
    pub max_batch_bytes: usize,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            export_max_rows: 20_000,
            batch_chunk_size: 500,
            max_batch_bytes: 4 * 1024 * 1024,
            log_format: LogFormat::Json,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables fall
    /// back to defaults; malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: parse_var("PROCURA_BIND_ADDR", get("PROCURA_BIND_ADDR"), defaults.bind_addr)?,
            database_url: get("DATABASE_URL"),
            export_max_rows: positive("PROCURA_EXPORT_MAX_ROWS", get("PROCURA_EXPORT_MAX_ROWS"), defaults.export_max_rows)?,
            batch_chunk_size: positive("PROCURA_BATCH_CHUNK_SIZE", get("PROCURA_BATCH_CHUNK_SIZE"), defaults.batch_chunk_size)?,
            max_batch_bytes: positive("PROCURA_MAX_BATCH_BYTES", get("PROCURA_MAX_BATCH_BYTES"), defaults.max_batch_bytes)?,
            log_format: match get("PROCURA_LOG_FORMAT") {
                Some(raw) => raw.parse()?,
                None => defaults.log_format,
            },
        })
    }
}

fn parse_var<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive(name: &'static str, raw: Option<String>, default: usize) -> Result<usize, ConfigError> {
    let value = parse_var(name, raw, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PROCURA_BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/procura"),
            ("PROCURA_EXPORT_MAX_ROWS", "100"),
            ("PROCURA_LOG_FORMAT", "Pretty"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/procura"));
        assert_eq!(config.export_max_rows, 100);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.batch_chunk_size, 500);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PROCURA_BATCH_CHUNK_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PROCURA_BATCH_CHUNK_SIZE", .. }));

        let err = AppConfig::from_lookup(lookup(&[("PROCURA_EXPORT_MAX_ROWS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PROCURA_EXPORT_MAX_ROWS", .. }));

        let err = AppConfig::from_lookup(lookup(&[("PROCURA_LOG_FORMAT", "xml")])).unwrap_err();
        assert!(matches!(err, ConfigError::LogFormat(_)));
    }
}
