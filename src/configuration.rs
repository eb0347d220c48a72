use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

fn default_nats_cluster() -> String {
    "localhost:4222".to_string()
}
fn default_worker_id() -> String {
    "worker-1".to_string()
}

/// Every field here is a `CONFIG (enumerated...)` entry from the external
/// interfaces section, each with the documented default.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub database_url: Secret<String>,
    pub webhook_secret: Secret<String>,

    #[serde(default = "default_nats_cluster")]
    pub nats_cluster: String,
    #[serde(default)]
    pub nats_tls_enabled: bool,
    #[serde(default = "default_nats_replicas")]
    pub nats_replicas: u8,

    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_concurrent_batches")]
    pub concurrent_batches: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_system_rate_limit")]
    pub system_rate_limit: u32,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u32,
    #[serde(default)]
    pub disable_rate_limit: bool,

    #[serde(default = "default_true")]
    pub webhook_queue_enabled: bool,
    #[serde(default = "default_webhook_max_retries")]
    pub webhook_max_retries: u32,
    #[serde(default = "default_webhook_batch_size")]
    pub webhook_batch_size: usize,
    #[serde(default = "default_webhook_flush_interval_ms")]
    pub webhook_flush_interval_ms: u64,

    pub dragonfly_url: Secret<String>,
    pub dragonfly_critical_url: Secret<String>,

    #[serde(default = "default_dry_run_latency_min_ms")]
    pub dry_run_latency_min_ms: u64,
    #[serde(default = "default_dry_run_latency_max_ms")]
    pub dry_run_latency_max_ms: u64,
    #[serde(default)]
    pub high_throughput_test_mode: bool,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_host")]
    pub http_host: String,

    pub clickhouse_url: String,
    #[serde(default = "default_clickhouse_database")]
    pub clickhouse_database: String,
}

fn default_nats_replicas() -> u8 {
    3
}
fn default_concurrent_batches() -> usize {
    10
}
fn default_max_concurrent_requests() -> usize {
    1000
}
fn default_system_rate_limit() -> u32 {
    10_000
}
fn default_rate_limit_per_second() -> u32 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_webhook_max_retries() -> u32 {
    3
}
fn default_webhook_batch_size() -> usize {
    100
}
fn default_webhook_flush_interval_ms() -> u64 {
    1000
}
fn default_dry_run_latency_min_ms() -> u64 {
    50
}
fn default_dry_run_latency_max_ms() -> u64 {
    250
}
fn default_http_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_clickhouse_database() -> String {
    "batchsender".to_string()
}

impl Settings {
    pub fn webhook_flush_interval(&self) -> Duration {
        Duration::from_millis(self.webhook_flush_interval_ms)
    }

    pub fn dry_run_latency_range(&self) -> (Duration, Duration) {
        (Duration::from_millis(self.dry_run_latency_min_ms), Duration::from_millis(self.dry_run_latency_max_ms))
    }

    pub fn database_url(&self) -> &str {
        self.database_url.expose_secret()
    }
}

/// Layered load: `configuration/base.yaml`, overridden by
/// `configuration/{local,production}.yaml` (selected by `APP_ENVIRONMENT`),
/// overridden by `APP_`-prefixed environment variables with `__` as the
/// nesting separator, mirroring the teacher's `get_configuration`.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let base_path = std::env::current_dir().expect("failed to determine current directory");
    let configuration_dir = base_path.join("configuration");

    let environment: AppEnvironment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("failed to parse APP_ENVIRONMENT");

    let settings = Config::builder()
        .add_source(File::from(configuration_dir.join("base")).required(false))
        .add_source(File::from(configuration_dir.join(environment.as_str())).required(false))
        .add_source(Environment::with_prefix("APP").prefix_separator("_").separator("__"))
        .build()?;

    settings.try_deserialize()
}

/// `local` loads looser defaults (e.g. TLS disabled); `production` is
/// stricter. Mirrors the teacher's environment-selection enum.
enum AppEnvironment {
    Local,
    Production,
}

impl AppEnvironment {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Production => "production",
        }
    }
}

impl TryFrom<String> for AppEnvironment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!("{other} is not a supported environment, use `local` or `production`")),
        }
    }
}
