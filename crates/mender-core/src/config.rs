//! Settings for queue backends and workers.
//!
//! Every key is read from `DOC_HEALING_<KEY>`, falling back to `<KEY>`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::ports::BackendKind;

const ENV_PREFIX: &str = "DOC_HEALING_";

/// Read `DOC_HEALING_{key}`, then `{key}`.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .or_else(|_| std::env::var(key))
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Full,
    Lightweight,
    Hybrid,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Lightweight => "lightweight",
            Self::Hybrid => "hybrid",
        })
    }
}

impl FromStr for DeploymentMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "lightweight" => Ok(Self::Lightweight),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(QueueError::Config(format!("unknown deployment mode `{other}`"))),
        }
    }
}

impl FromStr for BackendKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(QueueError::Config(format!("unknown queue backend `{other}`"))),
        }
    }
}

/// Where the Redis backend connects. `url` wins over the host/port/db triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl RedisSettings {
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Connection target safe for logs.
    pub fn describe(&self) -> String {
        if self.url.is_some() {
            "REDIS_URL".to_string()
        } else {
            format!("{}:{}/{}", self.host, self.port, self.db)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub deployment_mode: DeploymentMode,

    #[serde(default = "default_queue_backend")]
    pub queue_backend: BackendKind,

    #[serde(default)]
    pub redis: RedisSettings,

    /// Worker tasks started by the in-memory backend in asynchronous mode.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Run handlers inside `enqueue` instead of on workers (in-memory only).
    #[serde(default)]
    pub sync_processing: bool,

    /// Extra attempts for a failed task. 0 keeps at-most-once execution.
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            deployment_mode: DeploymentMode::default(),
            queue_backend: default_queue_backend(),
            redis: RedisSettings::default(),
            worker_threads: default_worker_threads(),
            sync_processing: false,
            max_retries: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

impl Settings {
    /// In-memory settings, the usual starting point for tests.
    pub fn memory(sync_processing: bool, worker_threads: usize) -> Self {
        Self {
            queue_backend: BackendKind::Memory,
            sync_processing,
            worker_threads,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, QueueError> {
        let mut settings = Self::default();

        if let Some(mode) = get_env_with_prefix("DEPLOYMENT_MODE") {
            settings.deployment_mode = mode.parse()?;
        }
        if let Some(backend) = get_env_with_prefix("QUEUE_BACKEND") {
            settings.queue_backend = backend.parse()?;
        }
        if let Some(url) = get_env_with_prefix("REDIS_URL") {
            settings.redis.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(host) = get_env_with_prefix("REDIS_HOST") {
            settings.redis.host = host;
        }
        if let Some(port) = get_env_with_prefix("REDIS_PORT") {
            settings.redis.port = parse_value("REDIS_PORT", &port)?;
        }
        if let Some(db) = get_env_with_prefix("REDIS_DB") {
            settings.redis.db = parse_value("REDIS_DB", &db)?;
        }
        if let Some(password) = get_env_with_prefix("REDIS_PASSWORD") {
            settings.redis.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(threads) = get_env_with_prefix("WORKER_THREADS") {
            settings.worker_threads = parse_value("WORKER_THREADS", &threads)?;
        }
        if let Some(sync) = get_env_with_prefix("SYNC_PROCESSING") {
            settings.sync_processing = parse_bool("SYNC_PROCESSING", &sync)?;
        }
        if let Some(retries) = get_env_with_prefix("MAX_RETRIES") {
            settings.max_retries = parse_value("MAX_RETRIES", &retries)?;
        }
        if let Some(secs) = get_env_with_prefix("SHUTDOWN_TIMEOUT_SECS") {
            settings.shutdown_timeout_secs = parse_value("SHUTDOWN_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = get_env_with_prefix("HEALTH_CHECK_INTERVAL_SECS") {
            settings.health_check_interval_secs =
                parse_value("HEALTH_CHECK_INTERVAL_SECS", &secs)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queue_backend == BackendKind::Memory
            && !self.sync_processing
            && self.worker_threads == 0
        {
            return Err(QueueError::Config(
                "worker_threads must be at least 1 for asynchronous in-memory processing"
                    .to_string(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(QueueError::Config(
                "health_check_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, QueueError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| QueueError::Config(format!("{key}={raw:?}: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, QueueError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(QueueError::Config(format!("{key}={raw:?}: expected a boolean"))),
    }
}

fn default_queue_backend() -> BackendKind {
    BackendKind::Redis
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_worker_threads() -> usize {
    4
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_health_check_interval_secs() -> u64 {
    5
}
