use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::{constants, CapstanError, Result};

#[cfg(test)]
mod tests;

/// Service configuration, resolved once at startup from the environment.
///
/// Every knob has an enumerated `CAPSTAN_*` variable and a documented
/// default; a malformed value fails startup rather than being silently
/// replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub api: ApiConfig,
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub timeouts: TierTimeouts,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Explicit agent binary path. When unset the client probes `PATH` and
    /// the standard install locations at invoke time.
    pub binary_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bound on concurrently running executors.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_successes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Per-tier timeout budgets. Overridable per tier; defaults are the §fast
/// 10 min / balanced 30 min / deep 60 min budgets in `constants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTimeouts {
    pub fast: Duration,
    pub balanced: Duration,
    pub deep: Duration,
}

impl TierTimeouts {
    pub fn for_tier(&self, tier: crate::models::ModelTier) -> Duration {
        match tier {
            crate::models::ModelTier::Fast => self.fast,
            crate::models::ModelTier::Balanced => self.balanced,
            crate::models::ModelTier::Deep => self.deep,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Absent .env files are the normal case in production.
        if let Ok(path) = dotenv() {
            tracing::info!("Loaded .env file from: {:?}", path);
        }

        let data_dir = match env::var("CAPSTAN_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .ok_or_else(|| {
                    CapstanError::ConfigurationError(
                        "no per-user data directory available; set CAPSTAN_DATA_DIR".to_string(),
                    )
                })?
                .join("capstan"),
        };

        let db_path = match env::var("CAPSTAN_DB_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => data_dir.join("tasks.db"),
        };

        let log_dir = match env::var("CAPSTAN_LOG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => data_dir.clone(),
        };

        let api = ApiConfig {
            host: env::var("CAPSTAN_API_HOST")
                .unwrap_or_else(|_| constants::DEFAULT_API_HOST.to_string()),
            port: env_parse("CAPSTAN_API_PORT", constants::DEFAULT_API_PORT)?,
        };

        let agent = AgentConfig {
            binary_path: env::var("CAPSTAN_AGENT_BIN").ok(),
        };

        let scheduler = SchedulerConfig {
            concurrency: env_parse("CAPSTAN_CONCURRENCY", constants::DEFAULT_CONCURRENCY)?,
        };
        if scheduler.concurrency == 0 {
            return Err(CapstanError::ConfigurationError(
                "CAPSTAN_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let breaker = BreakerConfig {
            failure_threshold: env_parse(
                "CAPSTAN_BREAKER_THRESHOLD",
                constants::DEFAULT_BREAKER_FAILURE_THRESHOLD,
            )?,
            cooldown: env_secs(
                "CAPSTAN_BREAKER_COOLDOWN_SECS",
                constants::DEFAULT_BREAKER_COOLDOWN,
            )?,
            half_open_successes: env_parse(
                "CAPSTAN_BREAKER_HALF_OPEN_SUCCESSES",
                constants::DEFAULT_BREAKER_HALF_OPEN_SUCCESSES,
            )?,
        };

        let retry = RetryConfig {
            max_attempts: env_parse(
                "CAPSTAN_RETRY_ATTEMPTS",
                constants::DEFAULT_RETRY_ATTEMPTS,
            )?,
            base_delay: env_millis(
                "CAPSTAN_RETRY_BASE_DELAY_MS",
                constants::DEFAULT_RETRY_BASE_DELAY,
            )?,
            max_delay: env_millis(
                "CAPSTAN_RETRY_MAX_DELAY_MS",
                constants::DEFAULT_RETRY_MAX_DELAY,
            )?,
        };

        let timeouts = TierTimeouts {
            fast: env_secs("CAPSTAN_TIMEOUT_FAST_SECS", constants::FAST_TIER_TIMEOUT)?,
            balanced: env_secs(
                "CAPSTAN_TIMEOUT_BALANCED_SECS",
                constants::BALANCED_TIER_TIMEOUT,
            )?,
            deep: env_secs("CAPSTAN_TIMEOUT_DEEP_SECS", constants::DEEP_TIER_TIMEOUT)?,
        };

        let monitor = MonitorConfig {
            interval: env_secs(
                "CAPSTAN_MONITOR_INTERVAL_SECS",
                constants::DEFAULT_MONITOR_INTERVAL,
            )?,
        };

        Ok(Config {
            data_dir,
            db_path,
            log_dir,
            api,
            agent,
            scheduler,
            breaker,
            retry,
            timeouts,
            monitor,
        })
    }

    /// Configuration rooted in an explicit data directory, with every knob
    /// at its default. Used by tests and embedded callers.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Config {
            db_path: data_dir.join("tasks.db"),
            log_dir: data_dir.clone(),
            data_dir,
            api: ApiConfig {
                host: constants::DEFAULT_API_HOST.to_string(),
                port: constants::DEFAULT_API_PORT,
            },
            agent: AgentConfig { binary_path: None },
            scheduler: SchedulerConfig {
                concurrency: constants::DEFAULT_CONCURRENCY,
            },
            breaker: BreakerConfig {
                failure_threshold: constants::DEFAULT_BREAKER_FAILURE_THRESHOLD,
                cooldown: constants::DEFAULT_BREAKER_COOLDOWN,
                half_open_successes: constants::DEFAULT_BREAKER_HALF_OPEN_SUCCESSES,
            },
            retry: RetryConfig {
                max_attempts: constants::DEFAULT_RETRY_ATTEMPTS,
                base_delay: constants::DEFAULT_RETRY_BASE_DELAY,
                max_delay: constants::DEFAULT_RETRY_MAX_DELAY,
            },
            timeouts: TierTimeouts {
                fast: constants::FAST_TIER_TIMEOUT,
                balanced: constants::BALANCED_TIER_TIMEOUT,
                deep: constants::DEEP_TIER_TIMEOUT,
            },
            monitor: MonitorConfig {
                interval: constants::DEFAULT_MONITOR_INTERVAL,
            },
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            CapstanError::ConfigurationError(format!("invalid {key}={raw:?}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}
