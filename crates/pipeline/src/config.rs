use std::path::PathBuf;
use std::time::Duration;

use crate::analysis::AnalysisConfig;
use crate::batch::BatchConfig;
use crate::pipeline::PipelineConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::store::{DatabaseConfig, DatabaseType};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub analysis: AnalysisConfig,
    pub pipeline: PipelineConfig,
    /// Optional JSON file of alert rules loaded at startup.
    pub rules_path: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Config {
            database: DatabaseConfig {
                db_type: match std::env::var("DATABASE_TYPE")
                    .unwrap_or_else(|_| "sqlite".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "memory" => DatabaseType::Memory,
                    _ => DatabaseType::Sqlite,
                },
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or_else(|| Some(PathBuf::from("data/vigil.db"))),
            },
            analysis: AnalysisConfig {
                endpoint: std::env::var("ANALYSIS_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:9100/analyze".to_string()),
                api_key: std::env::var("ANALYSIS_API_KEY").ok(),
                request_timeout: Duration::from_secs(env_u64("ANALYSIS_TIMEOUT_SECONDS", 30)),
            },
            pipeline: PipelineConfig {
                batch: BatchConfig {
                    window_seconds: env_i64("BATCH_WINDOW_SECONDS", 60),
                    idle_seconds: env_i64("BATCH_IDLE_SECONDS", 30),
                    ttl_seconds: env_i64("BATCH_TTL_SECONDS", 3600),
                    sweep_interval: Duration::from_secs(env_u64("SWEEP_INTERVAL_SECONDS", 10)),
                    fast_path_threshold: std::env::var("FAST_PATH_CONFIDENCE")
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.9),
                    fast_path_types: std::env::var("FAST_PATH_TYPES")
                        .unwrap_or_else(|_| "person,fire,weapon".to_string())
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                },
                retry: RetryConfig {
                    max_retries: env_u64("MAX_RETRIES", 3) as u32,
                    base_delay: Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS", 500)),
                    max_delay: Duration::from_millis(env_u64("RETRY_MAX_DELAY_MS", 30_000)),
                    ..RetryConfig::default()
                },
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: env_u64("CIRCUIT_FAILURE_THRESHOLD", 5) as u32,
                    recovery_timeout: Duration::from_secs(env_u64("CIRCUIT_RECOVERY_SECONDS", 30)),
                    success_threshold: env_u64("CIRCUIT_SUCCESS_THRESHOLD", 2) as u32,
                    half_open_max_calls: env_u64("CIRCUIT_HALF_OPEN_MAX_CALLS", 1) as u32,
                    ..CircuitBreakerConfig::default()
                },
                dlq_capacity: env_u64("DLQ_CAPACITY", 1000) as usize,
                queue_capacity: env_u64("ANALYSIS_QUEUE_CAPACITY", 100) as usize,
            },
            rules_path: std::env::var("RULES_PATH").ok(),
        };

        if config.analysis.api_key.is_none() {
            tracing::warn!("ANALYSIS_API_KEY is not set; analysis requests will be unauthenticated");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().map_err(Error::Config)?;

        if self.analysis.endpoint.is_empty() {
            return Err(Error::Config("ANALYSIS_ENDPOINT must not be empty".to_string()));
        }
        let batch = &self.pipeline.batch;
        if batch.window_seconds <= 0 {
            return Err(Error::Config("BATCH_WINDOW_SECONDS must be positive".to_string()));
        }
        if batch.idle_seconds <= 0 {
            return Err(Error::Config("BATCH_IDLE_SECONDS must be positive".to_string()));
        }
        if batch.ttl_seconds <= 0 {
            return Err(Error::Config("BATCH_TTL_SECONDS must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&batch.fast_path_threshold) {
            return Err(Error::Config(
                "FAST_PATH_CONFIDENCE must be between 0 and 1".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::Config("ANALYSIS_QUEUE_CAPACITY must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            analysis: AnalysisConfig {
                endpoint: "http://localhost:9100/analyze".to_string(),
                api_key: None,
                request_timeout: Duration::from_secs(30),
            },
            pipeline: PipelineConfig::default(),
            rules_path: None,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.batch.window_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.batch.ttl_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.batch.fast_path_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.endpoint.clear();
        assert!(config.validate().is_err());
    }
}
