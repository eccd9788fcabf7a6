//! fleet.toml configuration parser.
//!
//! Every key is optional; accessors return the built-in default when a
//! key is absent so callers never handle `None` themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

pub const DEFAULT_MANAGER_PORT: u16 = 7777;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_PROCESS_NAME: &str = "fleetd";
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 60;
/// One year.
pub const MAX_IDLE_TIMEOUT_MINUTES: u64 = 525_600;
pub const DEFAULT_CPU_THRESHOLD: f64 = 80.0;
pub const DEFAULT_MEM_THRESHOLD: f64 = 80.0;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_WORKER_BASE_PORT: u16 = 9000;
pub const DEFAULT_WORKER_PORT_RANGE: u16 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{key}`: {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub manager: ManagerConfig,
    pub deployment: DeploymentConfig,
    pub pool: PoolConfig,
    pub thresholds: ThresholdConfig,
    pub transport: TransportConfig,
    pub auth: AuthConfig,
    pub factory: FactoryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub port: Option<u16>,
    pub tick: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Substring expected in the singleton's command line.
    pub process_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Deployment target type, e.g. "prod" or "dev".
    pub target: Option<String>,
    /// Secondary non-standard infrastructure type.
    pub secondary_infra: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub idle_worker_count: Option<u32>,
    pub idle_thread_pool_count: Option<u32>,
    pub nonstandard_idle_worker_count: Option<u32>,
    pub nonstandard_idle_thread_pool_count: Option<u32>,
    pub idle_timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub disabled: bool,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub https: bool,
    pub host: Option<String>,
    pub connect_timeout: Option<String>,
    /// Extra PEM roots trusted for HTTPS worker endpoints.
    pub ca_file: Option<PathBuf>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub admin_password_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Worker executable; spawning is disabled when unset.
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub base_port: Option<u16>,
    pub port_range: Option<u16>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can only be checked after parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manager.tick()?;
        self.transport.connect_timeout()?;
        self.transport.retry_delay()?;

        for (key, value) in [
            ("thresholds.cpu_percent", self.thresholds.cpu_percent),
            ("thresholds.mem_percent", self.thresholds.mem_percent),
        ] {
            if let Some(v) = value
                && !(v.is_finite() && v >= 0.0)
            {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{v} is not a percentage"),
                });
            }
        }
        if let Some(minutes) = self.pool.idle_timeout_minutes
            && minutes > MAX_IDLE_TIMEOUT_MINUTES
        {
            return Err(ConfigError::Invalid {
                key: "pool.idle_timeout_minutes",
                reason: format!("{minutes} exceeds {MAX_IDLE_TIMEOUT_MINUTES}"),
            });
        }
        if self.transport.retry_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                key: "transport.retry_attempts",
                reason: "at least one attempt is required".into(),
            });
        }
        Ok(())
    }
}

fn duration_or(
    key: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(v) => parse_duration(v).ok_or_else(|| ConfigError::InvalidDuration {
            key,
            value: v.clone(),
        }),
        None => Ok(default),
    }
}

impl ManagerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_MANAGER_PORT)
    }

    pub fn tick(&self) -> Result<Duration, ConfigError> {
        duration_or("manager.tick", &self.tick, DEFAULT_TICK)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleet"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log/fleet"))
    }

    pub fn process_name(&self) -> &str {
        self.process_name.as_deref().unwrap_or(DEFAULT_PROCESS_NAME)
    }
}

impl TransportConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn connect_timeout(&self) -> Result<Duration, ConfigError> {
        duration_or(
            "transport.connect_timeout",
            &self.connect_timeout,
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS)
    }

    pub fn retry_delay(&self) -> Result<Duration, ConfigError> {
        duration_or("transport.retry_delay", &self.retry_delay, DEFAULT_RETRY_DELAY)
    }
}

impl FactoryConfig {
    pub fn base_port(&self) -> u16 {
        self.base_port.unwrap_or(DEFAULT_WORKER_BASE_PORT)
    }

    pub fn port_range(&self) -> u16 {
        self.port_range.unwrap_or(DEFAULT_WORKER_PORT_RANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml("").unwrap();
        assert_eq!(config.manager.port(), DEFAULT_MANAGER_PORT);
        assert_eq!(config.manager.tick().unwrap(), Duration::from_secs(1));
        assert_eq!(config.manager.process_name(), "fleetd");
        assert_eq!(config.transport.host(), "localhost");
        assert_eq!(
            config.transport.connect_timeout().unwrap(),
            Duration::from_secs(15)
        );
        assert_eq!(config.transport.retry_attempts(), 5);
        assert_eq!(config.transport.retry_delay().unwrap(), Duration::from_secs(2));
        assert!(!config.transport.https);
        assert!(!config.thresholds.disabled);
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
[manager]
port = 7100
tick = "500ms"

[deployment]
target = "prod"
secondary_infra = false

[pool]
idle_worker_count = 6
idle_thread_pool_count = 3
idle_timeout_minutes = 30

[thresholds]
disabled = true
cpu_percent = 90.0

[transport]
https = true
host = "agent.example.com"
connect_timeout = "5s"

[auth]
admin_user = "admin"
admin_password = "secret"

[factory]
command = "/opt/fleet/worker"
args = ["--mode", "worker"]
base_port = 9100
"#;
        let config = FleetConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.manager.port(), 7100);
        assert_eq!(config.manager.tick().unwrap(), Duration::from_millis(500));
        assert_eq!(config.deployment.target.as_deref(), Some("prod"));
        assert_eq!(config.pool.idle_worker_count, Some(6));
        assert_eq!(config.thresholds.cpu_percent, Some(90.0));
        assert!(config.transport.https);
        assert_eq!(config.transport.host(), "agent.example.com");
        assert_eq!(config.factory.base_port(), 9100);
        assert_eq!(config.factory.args.len(), 2);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let err = FleetConfig::from_toml("[manager]\ntick = \"often\"\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { key: "manager.tick", .. }
        ));
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let err = FleetConfig::from_toml("[thresholds]\nmem_percent = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_retry_attempts_is_rejected() {
        let err = FleetConfig::from_toml("[transport]\nretry_attempts = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "transport.retry_attempts", .. }
        ));
    }

    #[test]
    fn oversized_idle_timeout_is_rejected() {
        let err = FleetConfig::from_toml("[pool]\nidle_timeout_minutes = 9223372036854775807\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "pool.idle_timeout_minutes", .. }
        ));
        assert!(FleetConfig::from_toml("[pool]\nidle_timeout_minutes = 525600\n").is_ok());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = FleetConfig::from_file(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fleet.toml"));
    }
}
