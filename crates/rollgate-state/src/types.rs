//! Domain types for the Rollgate state store.
//!
//! These types represent the persisted state of target groups, deployments,
//! strategy progress, and cohort snapshots. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use rollgate_core::{
    DeploymentId, GateConfig, GroupId, HealthThresholds, InstanceId, StrategyKind, Version,
};

// ── Target group ──────────────────────────────────────────────────

/// Health tag attached to an instance by whoever registered it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTag {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A single deployable instance and the version it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub version: Version,
    #[serde(default)]
    pub health: HealthTag,
}

/// Share of live traffic routed to a candidate version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub version: Version,
    /// 0–100.
    pub percent: u8,
}

/// A named set of instances that rollouts target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub id: GroupId,
    /// Instances serving live traffic.
    pub instances: Vec<Instance>,
    /// Blue-green standby pool. Receives no traffic; empty outside blue-green rollouts.
    #[serde(default)]
    pub standby: Vec<Instance>,
    /// Canary traffic split, if any.
    #[serde(default)]
    pub traffic: Option<TrafficSplit>,
    /// Optimistic concurrency counter, bumped on every committed mutation.
    #[serde(default)]
    pub revision: u64,
    /// Unix timestamp of the last committed mutation.
    #[serde(default)]
    pub updated_at: u64,
}

impl TargetGroup {
    /// Build a group whose instances all run `version`.
    pub fn new(id: &str, version: &str, instance_ids: &[InstanceId]) -> Self {
        Self {
            id: id.to_string(),
            instances: instance_ids
                .iter()
                .map(|iid| Instance {
                    id: iid.clone(),
                    version: version.to_string(),
                    health: HealthTag::Unknown,
                })
                .collect(),
            standby: Vec::new(),
            traffic: None,
            revision: 0,
            updated_at: 0,
        }
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances
            .iter()
            .chain(self.standby.iter())
            .find(|inst| inst.id == id)
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|inst| inst.id.clone()).collect()
    }

    /// Live instance id → version.
    pub fn versions(&self) -> BTreeMap<InstanceId, Version> {
        self.instances
            .iter()
            .map(|inst| (inst.id.clone(), inst.version.clone()))
            .collect()
    }

    /// The version every live instance runs, if they agree.
    pub fn uniform_version(&self) -> Option<&str> {
        let first = self.instances.first()?;
        self.instances
            .iter()
            .all(|inst| inst.version == first.version)
            .then_some(first.version.as_str())
    }

    /// Live instances currently on `version`.
    pub fn on_version(&self, version: &str) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|inst| inst.version == version)
            .map(|inst| inst.id.clone())
            .collect()
    }
}

// ── Cohort snapshot ───────────────────────────────────────────────

/// Three-way health classification of a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

/// Aggregated metrics the verdict was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMetrics {
    /// Error rate as a fraction (0.0–1.0).
    pub error_rate: f64,
    pub latency_p95_ms: u64,
    pub sample_count: u64,
    /// Unix timestamp the collaborator reported for the sample.
    pub observed_at: u64,
    /// Optional collaborator-defined signal, recorded for audit only.
    #[serde(default)]
    pub custom: Option<f64>,
}

/// Immutable record of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSnapshot {
    /// Empty until stamped by the controller.
    #[serde(default)]
    pub deployment_id: DeploymentId,
    /// Position in the deployment's history, assigned on append.
    #[serde(default)]
    pub seq: u64,
    pub group_id: GroupId,
    /// Human label of the rollout step being evaluated (e.g. "canary 25%").
    #[serde(default)]
    pub step: String,
    pub cohort: Vec<InstanceId>,
    pub metrics: Option<CohortMetrics>,
    pub verdict: Verdict,
    /// Why the verdict was reached when it is not a plain threshold comparison.
    pub note: Option<String>,
    pub recorded_at: u64,
}

impl CohortSnapshot {
    pub fn table_key(&self) -> String {
        format!("{}:{:010}", self.deployment_id, self.seq)
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Paused,
    Succeeded,
    RolledBack,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::RolledBack | DeploymentStatus::Failed
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Paused => "paused",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// Why a deployment stopped short of success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// The step that was exposed when the failure happened.
    pub step: String,
    pub reason: String,
    /// Last evaluation before the failure, for post-mortem.
    pub snapshot: Option<CohortSnapshot>,
}

/// One rollout attempt of `desired_version` onto a target group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub group_id: GroupId,
    /// Live instance ids captured at start, in registry order.
    pub instance_ids: Vec<InstanceId>,
    pub strategy: StrategyKind,
    pub gate: GateConfig,
    pub desired_version: Version,
    /// Last-known-good version, restored on rollback.
    pub previous_version: Version,
    pub status: DeploymentStatus,
    /// Set once a rollback is owed (operator abort or failed gate) so a
    /// restarted loop finishes it.
    #[serde(default)]
    pub abort_requested: bool,
    pub started_at: u64,
    pub last_transition_at: u64,
    pub failure: Option<FailureReport>,
}

impl Deployment {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `status`, stamping the transition time.
    pub fn transition(&mut self, status: DeploymentStatus, now: u64) {
        self.status = status;
        self.last_transition_at = now;
    }
}

// ── Strategy progress ─────────────────────────────────────────────

/// Where a blue-green rollout stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum BlueGreenPhase {
    /// Nothing provisioned yet.
    Idle,
    /// Standby pool runs the new version without traffic.
    StandbyProvisioned,
    /// Traffic switched; the old pool is kept for `grace_remaining` more ticks.
    Flipped { grace_remaining: u32 },
    /// Old pool removed.
    Decommissioned,
}

/// Strategy-specific progress counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Progress {
    Rolling {
        batches_applied: u32,
    },
    BlueGreen {
        phase: BlueGreenPhase,
    },
    Canary {
        /// Index into the configured steps of the last applied step.
        step_index: Option<usize>,
        /// Traffic percent currently routed to the new version.
        percent: u8,
    },
}

/// Persisted progress of a deployment, enough to resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyState {
    pub deployment_id: DeploymentId,
    pub progress: Progress,
    /// Whether the latest exposure has passed its health gate.
    pub gate_open: bool,
    /// Consecutive inconclusive verdicts on the latest exposure.
    pub inconclusive_ticks: u32,
    /// Ticks executed so far.
    pub ticks: u64,
}
