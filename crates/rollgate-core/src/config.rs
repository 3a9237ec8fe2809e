//! rollgate.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parse_duration;
use crate::types::{
    BlueGreenConfig, CanaryConfig, GateConfig, HealthThresholds, RollingConfig, StrategyKind,
};

/// Errors raised when a configuration value cannot be used.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollgateConfig {
    pub daemon: DaemonConfig,
    pub controller: ControllerConfig,
    pub health: HealthThresholds,
    pub rolling: RollingConfig,
    pub canary: CanaryConfig,
    pub blue_green: BlueGreenConfig,
    pub metrics: MetricsConfig,
    pub artifacts: ArtifactsConfig,
    pub groups: Vec<GroupSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 8470,
            data_dir: PathBuf::from("/var/lib/rollgate"),
        }
    }
}

/// Timing and retry knobs for the per-deployment control loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval: String,
    pub evaluation_timeout: String,
    pub abort_timeout: String,
    pub conflict_retries: u32,
    pub conflict_backoff: String,
    pub max_inconclusive_ticks: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "15s".to_string(),
            evaluation_timeout: "5s".to_string(),
            abort_timeout: "10s".to_string(),
            conflict_retries: 5,
            conflict_backoff: "50ms".to_string(),
            max_inconclusive_ticks: 3,
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("controller.tick_interval", &self.tick_interval)
    }

    pub fn evaluation_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("controller.evaluation_timeout", &self.evaluation_timeout)
    }

    pub fn abort_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("controller.abort_timeout", &self.abort_timeout)
    }

    pub fn conflict_backoff(&self) -> Result<Duration, ConfigError> {
        duration_field("controller.conflict_backoff", &self.conflict_backoff)
    }
}

/// Where the health evaluator reads cohort metrics from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSourceKind {
    /// Query an HTTP metrics endpoint.
    Http,
    /// Report a fixed sample. Useful for dry runs.
    #[default]
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub source: MetricsSourceKind,
    /// Base URL of the metrics collaborator (e.g. "http://127.0.0.1:9400").
    pub endpoint: Option<String>,
    pub static_error_rate: f64,
    pub static_latency_p95_ms: u64,
    pub static_sample_count: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            source: MetricsSourceKind::Static,
            endpoint: None,
            static_error_rate: 0.0,
            static_latency_p95_ms: 50,
            static_sample_count: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Versions still available for rollback. `None` treats every version as deployable.
    pub retained: Option<Vec<String>>,
}

/// A target group the daemon registers on startup if it is not already known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSeed {
    pub id: String,
    pub version: String,
    /// Explicit instance ids. Takes precedence over `instances`.
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// Number of instances to generate as `<id>-<n>` when no ids are given.
    #[serde(default)]
    pub instances: u32,
}

impl GroupSeed {
    pub fn resolved_instance_ids(&self) -> Vec<String> {
        if !self.instance_ids.is_empty() {
            return self.instance_ids.clone();
        }
        (0..self.instances).map(|n| format!("{}-{n}", self.id)).collect()
    }
}

impl RollgateConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: RollgateConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The strategy called `name` on the command line, with this file's defaults.
    pub fn strategy(&self, name: &str) -> Option<StrategyKind> {
        match name {
            "rolling" => Some(StrategyKind::Rolling(self.rolling.clone())),
            "blue-green" | "blue_green" => Some(StrategyKind::BlueGreen(self.blue_green.clone())),
            "canary" => Some(StrategyKind::Canary(self.canary.clone())),
            _ => None,
        }
    }

    /// Gate parameters for new deployments. Thresholds are left to the daemon.
    pub fn gate(&self) -> GateConfig {
        GateConfig {
            max_inconclusive_ticks: self.controller.max_inconclusive_ticks,
            thresholds: None,
        }
    }

    /// Check every value that is only interpreted later (durations, thresholds, seeds).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.tick_interval()?;
        self.controller.evaluation_timeout()?;
        self.controller.abort_timeout()?;
        self.controller.conflict_backoff()?;
        self.health.validate().map_err(ConfigError::Invalid)?;

        if self.metrics.source == MetricsSourceKind::Http && self.metrics.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "metrics.source = \"http\" requires metrics.endpoint".to_string(),
            ));
        }
        for seed in &self.groups {
            if seed.resolved_instance_ids().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "group `{}` declares no instances",
                    seed.id
                )));
            }
        }
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchSize;

    #[test]
    fn empty_file_uses_defaults() {
        let config = RollgateConfig::from_toml_str("").unwrap();
        assert_eq!(config.daemon.port, 8470);
        assert_eq!(config.controller.tick_interval().unwrap(), Duration::from_secs(15));
        assert_eq!(config.controller.evaluation_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(config.canary.steps, vec![5, 25, 50, 100]);
        assert_eq!(config.metrics.source, MetricsSourceKind::Static);
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
[daemon]
port = 9000
data_dir = "/tmp/rollgate"

[controller]
tick_interval = "500ms"
max_inconclusive_ticks = 5

[health]
error_rate_max = 0.01
min_sample_size = 20

[rolling]
batch = { percent = 20 }

[canary]
steps = [10, 50, 100]

[metrics]
source = "http"
endpoint = "http://127.0.0.1:9400"

[artifacts]
retained = ["v1", "v2"]

[[groups]]
id = "web"
version = "v1"
instances = 4
"#;
        let config = RollgateConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.daemon.port, 9000);
        assert_eq!(config.controller.tick_interval().unwrap(), Duration::from_millis(500));
        assert_eq!(config.controller.max_inconclusive_ticks, 5);
        assert_eq!(config.health.min_sample_size, 20);
        assert_eq!(config.health.latency_p95_max_ms, 500);
        assert_eq!(config.rolling.batch, BatchSize::Percent(20));
        assert_eq!(config.canary.steps, vec![10, 50, 100]);
        assert_eq!(config.artifacts.retained.as_deref().map(<[String]>::len), Some(2));
        assert_eq!(
            config.groups[0].resolved_instance_ids(),
            vec!["web-0", "web-1", "web-2", "web-3"]
        );
    }

    #[test]
    fn strategy_by_name_uses_file_defaults() {
        let config = RollgateConfig::from_toml_str("[canary]\nsteps = [20, 100]\n").unwrap();
        match config.strategy("canary") {
            Some(StrategyKind::Canary(cfg)) => assert_eq!(cfg.steps, vec![20, 100]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(config.strategy("blue-green").map(|s| s.name()), Some("blue-green"));
        assert!(config.strategy("big-bang").is_none());
        assert_eq!(config.gate().max_inconclusive_ticks, 3);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = RollgateConfig::from_toml_str("[controller]\ntick_interval = \"often\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("controller.tick_interval"));
    }

    #[test]
    fn http_metrics_require_endpoint() {
        let err = RollgateConfig::from_toml_str("[metrics]\nsource = \"http\"\n").unwrap_err();
        assert!(err.to_string().contains("metrics.endpoint"));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = RollgateConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("tick_interval"));
        RollgateConfig::from_toml_str(&toml_str).unwrap();
    }
}
