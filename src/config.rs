use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

pub const ENV_CONFIG: &str = "INGESTION_GATEWAY_CONFIG";
pub const ENV_PORT: &str = "INGESTION_GATEWAY_PORT";
pub const ENV_HOST: &str = "INGESTION_GATEWAY_HOST";
pub const ENV_DATA_ROOT: &str = "INGESTION_GATEWAY_DATA_ROOT";
pub const ENV_DOWNSTREAM_URL: &str = "INGESTION_GATEWAY_DOWNSTREAM_URL";
pub const ENV_HIGH_WATER_MARK: &str = "INGESTION_GATEWAY_HIGH_WATER_MARK";
pub const ENV_DISPATCH_WORKERS: &str = "INGESTION_GATEWAY_DISPATCH_WORKERS";
pub const ENV_IDEMPOTENCY_BACKEND: &str = "INGESTION_GATEWAY_IDEMPOTENCY_BACKEND";
pub const ENV_METRICS_ADDR: &str = "INGESTION_GATEWAY_METRICS_ADDR";

pub const DEFAULT_PORT: u16 = 8081;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub service_name: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub idempotency: IdempotencyConfig,
    pub staging: StagingConfig,
    pub dispatcher: DispatcherConfig,
    pub downstream: DownstreamConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_root: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyBackend {
    Sqlite,
    Memory,
}

impl FromStr for IdempotencyBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(IdempotencyBackend::Sqlite),
            "memory" => Ok(IdempotencyBackend::Memory),
            other => Err(format!("unknown idempotency backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub backend: IdempotencyBackend,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StagingConfig {
    pub high_water_mark: u64,
    pub append_timeout_ms: u64,
    pub compaction_interval_secs: u64,
    pub compaction_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub workers: u32,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub enqueue_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownstreamConfig {
    /// e.g. `http://localhost:8090/v1/intelligence/process`; unset means log-only.
    pub url: Option<String>,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub default_filter: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "ingestion-gateway".to_string(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            idempotency: IdempotencyConfig::default(),
            staging: StagingConfig::default(),
            dispatcher: DispatcherConfig::default(),
            downstream: DownstreamConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            backend: IdempotencyBackend::Sqlite,
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 10_000,
            append_timeout_ms: 2_000,
            compaction_interval_secs: 600,
            compaction_retention_secs: 24 * 60 * 60,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 64,
            poll_interval_ms: 500,
            enqueue_timeout_ms: 5_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            multiplier: 2.0,
            max_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "ingestion-gateway.log".to_string(),
            default_filter: "ingestion_gateway=info,tower_http=info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the TOML file (explicit path or `INGESTION_GATEWAY_CONFIG`),
    /// then process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as `load`, with environment lookups going through `env`.
    pub fn load_with<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env(ENV_CONFIG).map(PathBuf::from));
        let mut config = match path {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_env(&env, ENV_PORT)? {
            self.server.port = port;
        }
        if let Some(host) = env(ENV_HOST).filter(|v| !v.trim().is_empty()) {
            self.server.host = host;
        }
        if let Some(root) = env(ENV_DATA_ROOT).filter(|v| !v.trim().is_empty()) {
            self.storage.data_root = PathBuf::from(root);
        }
        if let Some(url) = env(ENV_DOWNSTREAM_URL).filter(|v| !v.trim().is_empty()) {
            self.downstream.url = Some(url);
        }
        if let Some(hwm) = parse_env(&env, ENV_HIGH_WATER_MARK)? {
            self.staging.high_water_mark = hwm;
        }
        if let Some(workers) = parse_env(&env, ENV_DISPATCH_WORKERS)? {
            self.dispatcher.workers = workers;
        }
        if let Some(backend) = parse_env(&env, ENV_IDEMPOTENCY_BACKEND)? {
            self.idempotency.backend = backend;
        }
        if let Some(addr) = env(ENV_METRICS_ADDR).filter(|v| !v.trim().is_empty()) {
            self.metrics.listen_addr = Some(addr);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatcher;
        if d.workers == 0 {
            return Err(ConfigError::Invalid("dispatcher.workers must be at least 1".into()));
        }
        if d.batch_size == 0 {
            return Err(ConfigError::Invalid("dispatcher.batch_size must be at least 1".into()));
        }
        if self.staging.high_water_mark == 0 {
            return Err(ConfigError::Invalid("staging.high_water_mark must be at least 1".into()));
        }
        if !(d.backoff.multiplier >= 1.0) {
            return Err(ConfigError::Invalid("dispatcher.backoff.multiplier must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&d.backoff.jitter) {
            return Err(ConfigError::Invalid("dispatcher.backoff.jitter must be in [0, 1)".into()));
        }
        if d.backoff.base_ms > d.backoff.max_ms {
            return Err(ConfigError::Invalid(format!(
                "dispatcher.backoff.base_ms ({}) exceeds max_ms ({})",
                d.backoff.base_ms, d.backoff.max_ms
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_env<F, T>(env: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match env(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}
