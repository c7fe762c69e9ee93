//! Configuration structures and loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main control-plane configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub debug: bool,

    /// Local proxy the health monitor's probes are issued against.
    #[serde(default)]
    pub proxy: ProxyConfiguration,

    #[serde(default)]
    pub redis: RedisConfiguration,

    #[serde(default)]
    pub logging: LoggingConfiguration,

    #[serde(default)]
    pub health: HealthDefaults,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    #[serde(default)]
    pub auto_restart: bool,
}

impl Configuration {
    /// Load configuration from a TOML file, creating the log directory if needed.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;

        std::fs::create_dir_all(&config.logging.log_dir).with_context(|| {
            format!(
                "failed to create log directory: {}",
                config.logging.log_dir.display()
            )
        })?;

        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            proxy: ProxyConfiguration::default(),
            redis: RedisConfiguration::default(),
            logging: LoggingConfiguration::default(),
            health: HealthDefaults::default(),
            stop_grace_secs: default_stop_grace(),
            auto_restart: false,
        }
    }
}

/// The local proxy that health probes are issued against:
/// `http://{host}:{port}/agent/{id}{endpoint}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfiguration {
    #[serde(default = "default_proxy_host")]
    pub host: String,

    #[serde(default = "default_proxy_port")]
    pub port: u16,

    #[serde(default = "default_bearer_token")]
    pub bearer_token: String,
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            bearer_token: default_bearer_token(),
        }
    }
}

fn default_proxy_host() -> String {
    "127.0.0.1".into()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_bearer_token() -> String {
    "agentainer-default-token".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfiguration {
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfiguration {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            db: 0,
        }
    }
}

fn default_redis_addr() -> String {
    "redis://127.0.0.1:6379".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub console_logging_enabled: bool,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_logging_enabled: true,
        }
    }
}

fn default_log_dir() -> PathBuf {
    dirs_home_logs()
}

fn dirs_home_logs() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".agentainer").join("logs")
}

/// Defaults applied to an agent's `health_config` when the deployment
/// request does not provide one.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthDefaults {
    #[serde(default = "default_health_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            endpoint: default_health_endpoint(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            retries: default_health_retries(),
        }
    }
}

fn default_health_endpoint() -> String {
    "/health".into()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_retries() -> u32 {
    3
}

fn default_stop_grace() -> u64 {
    10
}
