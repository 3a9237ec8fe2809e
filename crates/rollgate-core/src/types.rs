//! Shared types used across Rollgate crates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment (UUID v4 string).
pub type DeploymentId = String;

/// Identifier of a target group.
pub type GroupId = String;

/// Identifier of an instance within a target group.
pub type InstanceId = String;

/// Opaque artifact version. Never parsed or validated.
pub type Version = String;

// ── Health thresholds ──────────────────────────────────────────────

/// Thresholds the health evaluator classifies a cohort against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Highest acceptable error rate, as a fraction (0.0–1.0).
    pub error_rate_max: f64,
    /// Highest acceptable p95 latency in milliseconds.
    pub latency_p95_max_ms: u64,
    /// Samples required before any verdict other than inconclusive.
    pub min_sample_size: u64,
    /// Metrics window queried per evaluation, in seconds.
    pub evaluation_window_secs: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate_max: 0.05,
            latency_p95_max_ms: 500,
            min_sample_size: 100,
            evaluation_window_secs: 60,
        }
    }
}

impl HealthThresholds {
    pub fn latency_p95_max(&self) -> Duration {
        Duration::from_millis(self.latency_p95_max_ms)
    }

    pub fn evaluation_window(&self) -> Duration {
        Duration::from_secs(self.evaluation_window_secs)
    }

    /// Reject thresholds that could never produce a sensible verdict.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.error_rate_max) {
            return Err(format!(
                "error_rate_max must be within 0.0..=1.0, got {}",
                self.error_rate_max
            ));
        }
        if self.evaluation_window_secs == 0 {
            return Err("evaluation_window_secs must be positive".to_string());
        }
        Ok(())
    }
}

// ── Strategies ─────────────────────────────────────────────────────

/// How many instances a rolling update moves per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSize {
    /// A fixed number of instances.
    Count(u32),
    /// A percentage of the group, rounded up.
    Percent(u8),
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::Count(1)
    }
}

impl BatchSize {
    /// Number of instances per batch for a group of `total` instances.
    ///
    /// Always at least 1 and never more than `total` (for non-empty groups).
    pub fn resolve(&self, total: usize) -> usize {
        let size = match *self {
            BatchSize::Count(n) => n as usize,
            BatchSize::Percent(p) => (total * p as usize).div_ceil(100),
        };
        size.clamp(1, total.max(1))
    }
}

/// Configuration for rolling updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    pub batch: BatchSize,
}

/// Configuration for canary deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Traffic percentages routed to the new version, strictly increasing, ending at 100.
    pub steps: Vec<u8>,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            steps: vec![5, 25, 50, 100],
        }
    }
}

/// Configuration for blue-green switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenConfig {
    /// Evaluated ticks the old pool stays provisioned after the flip.
    pub grace_ticks: u32,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self { grace_ticks: 1 }
    }
}

/// How to roll out a new version to a target group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    /// Replace instances in batches. Default.
    Rolling(RollingConfig),
    /// Provision a full standby pool, then switch all traffic at once.
    BlueGreen(BlueGreenConfig),
    /// Shift traffic to the new version in percentage steps.
    Canary(CanaryConfig),
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::Rolling(RollingConfig::default())
    }
}

impl StrategyKind {
    /// The CLI spelling of this strategy.
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Rolling(_) => "rolling",
            StrategyKind::BlueGreen(_) => "blue-green",
            StrategyKind::Canary(_) => "canary",
        }
    }
}

/// Gate parameters shared by every strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Consecutive inconclusive verdicts tolerated before treating the step as failed.
    pub max_inconclusive_ticks: u32,
    /// Per-deployment override of the daemon's health thresholds.
    pub thresholds: Option<HealthThresholds>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_inconclusive_ticks: 3,
            thresholds: None,
        }
    }
}
