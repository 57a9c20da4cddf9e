//! Process configuration, read from environment variables.
//!
//! Unset optional values select the in-memory or disabled adapter; the
//! binary decides which and logs it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::QueueSettings;
use crate::worker::{MAX_BATCH_SIZE, WorkerSettings};

pub const DEFAULT_CODE_GENERATION_QUEUE: &str = "forgegen:code-generation";
pub const DEFAULT_DEPLOYMENT_QUEUE: &str = "forgegen:deployment";
pub const DEFAULT_BLOB_DIR: &str = "./artifacts";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub worker: WorkerSettings,
    pub queue: QueueSettings,
    pub code_generation_queue: String,
    pub deployment_queue: String,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub blob_dir: PathBuf,
    pub blob_base_url: String,
    pub generator_url: Option<String>,
    pub deployer_url: Option<String>,
    pub external_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = WorkerSettings::default();
        let queue_defaults = QueueSettings::default();

        let worker = WorkerSettings {
            batch_size: env
                .parse("WORKER_BATCH_SIZE", defaults.batch_size)?
                .clamp(1, MAX_BATCH_SIZE),
            wait: Duration::from_secs(env.parse("WORKER_WAIT_SECS", defaults.wait.as_secs())?),
            empty_backoff: Duration::from_millis(
                env.parse("WORKER_EMPTY_BACKOFF_MS", defaults.empty_backoff.as_millis() as u64)?,
            ),
            error_backoff: Duration::from_millis(
                env.parse("WORKER_ERROR_BACKOFF_MS", defaults.error_backoff.as_millis() as u64)?,
            ),
            concurrent_dispatch: env.parse("WORKER_CONCURRENT_DISPATCH", defaults.concurrent_dispatch)?,
        };

        let queue = QueueSettings {
            visibility_timeout: Duration::from_secs(env.parse(
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                queue_defaults.visibility_timeout.as_secs(),
            )?),
            max_receive_count: env.parse("QUEUE_MAX_RECEIVE_COUNT", queue_defaults.max_receive_count)?,
        };
        if queue.max_receive_count == 0 {
            return Err(ConfigError::Invalid {
                key: "QUEUE_MAX_RECEIVE_COUNT",
                value: "0".to_string(),
            });
        }

        let blob_dir = PathBuf::from(env.get("BLOB_DIR").unwrap_or_else(|| DEFAULT_BLOB_DIR.to_string()));
        let blob_base_url = env
            .get("BLOB_BASE_URL")
            .unwrap_or_else(|| format!("file://{}", blob_dir.display()));

        Ok(Self {
            worker,
            queue,
            code_generation_queue: env
                .get("CODE_GENERATION_QUEUE")
                .unwrap_or_else(|| DEFAULT_CODE_GENERATION_QUEUE.to_string()),
            deployment_queue: env
                .get("DEPLOYMENT_QUEUE")
                .unwrap_or_else(|| DEFAULT_DEPLOYMENT_QUEUE.to_string()),
            redis_url: env.get("REDIS_URL"),
            database_url: env.get("DATABASE_URL"),
            blob_dir,
            blob_base_url,
            generator_url: env.get("GENERATOR_URL"),
            deployer_url: env.get("DEPLOYER_URL"),
            external_timeout: Duration::from_secs(env.parse("EXTERNAL_TIMEOUT_SECS", 300)?),
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        }
    }
}
