use serde::Deserialize;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

use crate::store::StoreKind;

pub const DEFAULT_PROCESS_EVERY_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "none", alias = "off")]
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Silent => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub store: StoreKind,
    pub log_level: LogLevel,
    /// Development logging: pretty output with the call site's file and line.
    pub dev: bool,
    /// Tick interval in milliseconds.
    pub process_every_ms: u64,
    /// Maximum number of jobs executing at once within a tick.
    pub max_concurrency: usize,
    /// Connection URI for the MongoDB or Redis store.
    pub uri: Option<String>,
    /// CA file for TLS connections to MongoDB.
    pub cert_file: Option<String>,
    /// MongoDB database name. Falls back to the one in `uri`.
    pub database: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            log_level: LogLevel::default(),
            dev: false,
            process_every_ms: DEFAULT_PROCESS_EVERY_MS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            uri: None,
            cert_file: None,
            database: None,
        }
    }
}

impl SchedulerConfig {
    pub fn process_every(&self) -> Duration {
        Duration::from_millis(self.process_every_ms.max(1))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.process_every(), Duration::from_secs(1));
        assert_eq!(config.max_concurrency(), 10);
        assert!(!config.dev);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: SchedulerConfig = serde_json::from_value(json!({
            "store": "mongo",
            "log_level": "none",
            "dev": true,
            "process_every_ms": 250,
            "uri": "mongodb://localhost:27017/uptime_db"
        }))
        .unwrap();

        assert_eq!(config.store, StoreKind::MongoDb);
        assert_eq!(config.log_level, LogLevel::Silent);
        assert!(config.dev);
        assert_eq!(config.process_every(), Duration::from_millis(250));
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn rejects_unknown_store() {
        let result = serde_json::from_value::<SchedulerConfig>(json!({ "store": "sqlite" }));
        assert!(result.is_err());
    }

    #[test]
    fn zero_values_are_clamped() {
        let config = SchedulerConfig {
            process_every_ms: 0,
            max_concurrency: 0,
            ..Default::default()
        };
        assert_eq!(config.process_every(), Duration::from_millis(1));
        assert_eq!(config.max_concurrency(), 1);
        assert_eq!(LevelFilter::from(LogLevel::Silent), LevelFilter::OFF);
    }
}
