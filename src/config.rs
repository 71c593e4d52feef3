use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "HOMO_";

// 4MB, the default gRPC message limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: LOCAL_ENV.to_string(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Loads the YAML file at `path`, then applies `HOMO_` prefixed
    /// environment overrides (`HOMO_SERVER__LISTEN_ADDR=...`).
    pub fn from_path(path: &str) -> Result<Config> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_env() -> Result<Config> {
        let config: Config = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    fn from_yaml_str(config_str: &str) -> Result<Config> {
        let config: Config = Self::figment()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn generate(path: &str) -> Result<()> {
        let config = Config::default();
        let str = serde_yaml::to_string(&config)?;
        std::fs::write(path, str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!(
                "invalid listen address: {}",
                self.server.listen_addr
            ));
        }
        if self.server.max_message_size == 0 || self.client.max_message_size == 0 {
            return Err(anyhow!("max_message_size must be greater than zero"));
        }
        if self.server.concurrency_limit == Some(0) {
            return Err(anyhow!("concurrency_limit must be greater than zero"));
        }
        self.client.retry.validate()
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Upper bound for a single handler invocation. 0 disables the timeout.
    pub call_timeout_secs: u64,
    pub max_message_size: usize,
    /// Max in-flight calls per connection. Unlimited when unset.
    pub concurrency_limit: Option<usize>,
    pub invocation_cache: InvocationCacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:50051".to_string(),
            call_timeout_secs: 30,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            concurrency_limit: None,
            invocation_cache: InvocationCacheConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }
}

/// Responses remembered per FunctionInvokeID so retried calls are answered
/// without running the handler again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for InvocationCacheConfig {
    fn default() -> Self {
        InvocationCacheConfig {
            enabled: true,
            ttl_secs: 300,
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub address: String,
    pub connect_timeout_secs: u64,
    /// Per attempt. 0 disables the timeout.
    pub call_timeout_secs: u64,
    pub max_message_size: usize,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            address: "http://127.0.0.1:50051".to_string(),
            connect_timeout_secs: 5,
            call_timeout_secs: 30,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(anyhow!(
                "retry.factor must be a finite number >= 1, got {}",
                self.factor
            ));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow!(
                "retry.min_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.min_delay_ms,
                self.max_delay_ms
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Falls back to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when unset.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval_secs: 10,
            instance_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(!config.structured_logging());
        assert_eq!(
            config.server.call_timeout(),
            Some(Duration::from_secs(30))
        );
        assert!(config.instance_id().starts_with("local-"));
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = Config::from_yaml_str(
            r#"
env: production
server:
  listen_addr: 127.0.0.1:6000
  call_timeout_secs: 0
client:
  retry:
    max_attempts: 5
telemetry:
  instance_id: fn-1
"#,
        )
        .unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:6000");
        assert_eq!(config.server.call_timeout(), None);
        assert_eq!(config.server.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.client.retry.max_attempts, 5);
        assert_eq!(config.client.retry.min_delay_ms, 100);
        assert!(config.structured_logging());
        assert_eq!(config.instance_id(), "fn-1");
    }

    #[test]
    fn test_invalid_listen_addr() {
        let err = Config::from_yaml_str("server:\n  listen_addr: not-an-addr\n").unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test]
    fn test_invalid_retry() {
        let mut config = Config::default();
        config.client.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.retry.factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.retry.min_delay_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.retry.factor = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_retry_factor_is_rejected() {
        let err = Config::from_yaml_str("client:\n  retry:\n    factor: .nan\n").unwrap_err();
        assert!(err.to_string().contains("retry.factor"), "{err:#}");
    }

    #[test]
    fn test_generate_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let path = path.to_str().unwrap();
        Config::generate(path).unwrap();

        let config = Config::from_path(path).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:50051");
        assert_eq!(config.client.address, "http://127.0.0.1:50051");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "client:\n  address: http://fn-runtime:9000").unwrap();
        let config = Config::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.client.address, "http://fn-runtime:9000");
    }
}
