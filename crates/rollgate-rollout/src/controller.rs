//! Rollout controller — drives one deployment a tick at a time.
//!
//! A tick evaluates the current exposure if its gate is still closed, or
//! applies the next exposure and evaluates it right away. Every evaluation
//! is recorded as a snapshot and the strategy progress is persisted after
//! every tick, so a restarted daemon picks up where it stopped.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rollgate_core::{GateConfig, StrategyKind};
use rollgate_health::HealthEvaluator;
use rollgate_registry::{RegistryError, RegistryResult, TargetRegistry, assign_version};
use rollgate_state::{
    CohortSnapshot, Deployment, DeploymentStatus, FailureReport, HealthTag, Instance,
    StateStore, StrategyState, TargetGroup, TrafficSplit,
};

use crate::engine::{self, Exposure, NextAction};
use crate::error::{RolloutError, RolloutResult};
use crate::retry::RetryPolicy;
use crate::rollback::RollbackCoordinator;
use crate::strategy::{self, standby_id};

/// A deployment together with its strategy progress.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollout {
    pub deployment: Deployment,
    pub state: StrategyState,
    /// Latest recorded evaluation, if any.
    pub last_snapshot: Option<CohortSnapshot>,
}

impl Rollout {
    pub fn id(&self) -> &str {
        &self.deployment.id
    }

    /// Label of the step the rollout currently sits at.
    pub fn step(&self) -> String {
        engine::current_step(&self.deployment, &self.state)
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Paused or already terminal; nothing happened.
    Idle,
    /// The current exposure was kept; its gate is still closed.
    Held { step: String },
    /// The current exposure passed its gate; the next one follows next tick.
    GateOpened { step: String },
    /// A new exposure was applied.
    Advanced { step: String },
    Succeeded,
    RolledBack,
    Failed,
    /// A rollback is owed but could not be confirmed yet.
    RollbackPending,
}

/// Result of an operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Applied,
    /// The deployment was already in the requested state.
    Unchanged,
    /// The deployment had already finished; nothing was changed.
    Terminal,
    /// Not finished yet: a rollback still being retried, or the loop was
    /// too busy to answer in time.
    InProgress,
}

pub struct Controller {
    store: StateStore,
    registry: TargetRegistry,
    evaluator: HealthEvaluator,
    rollback: RollbackCoordinator,
    retry: RetryPolicy,
}

impl Controller {
    pub fn new(
        store: StateStore,
        registry: TargetRegistry,
        evaluator: HealthEvaluator,
        rollback: RollbackCoordinator,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            evaluator,
            rollback,
            retry,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Validate and persist a new deployment in `Pending`.
    ///
    /// Nothing is created when the parameters or the target are invalid,
    /// or when the group already has an active deployment.
    pub fn prepare(
        &self,
        group_id: &str,
        desired_version: &str,
        strategy: StrategyKind,
        gate: GateConfig,
    ) -> RolloutResult<Rollout> {
        strategy::validate(&strategy, &gate)?;

        let group = self.registry.get_group(group_id).map_err(|e| match e {
            RegistryError::NotFound(g) => RolloutError::Config(format!("unknown target group {g}")),
            other => other.into(),
        })?;
        if let Some(active) = self.store.active_deployment_for_group(group_id)? {
            return Err(RolloutError::ActiveDeployment {
                group: group_id.to_string(),
                deployment: active,
            });
        }
        let previous_version = strategy::baseline_version(&group, desired_version)?;
        if matches!(strategy, StrategyKind::BlueGreen(_)) {
            if let Some(clash) = group
                .instances
                .iter()
                .map(|inst| standby_id(&inst.id))
                .find(|sid| group.instance(sid).is_some())
            {
                return Err(RolloutError::Config(format!(
                    "standby id {clash} collides with a live instance"
                )));
            }
        }

        let now = rollgate_core::epoch_secs();
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            group_id: group.id.clone(),
            instance_ids: group.instance_ids(),
            strategy,
            gate,
            desired_version: desired_version.to_string(),
            previous_version,
            status: DeploymentStatus::Pending,
            abort_requested: false,
            started_at: now,
            last_transition_at: now,
            failure: None,
        };
        let state = engine::initial_state(&deployment);
        self.store.create_deployment(&deployment, &state)?;

        info!(
            deployment = %deployment.id,
            group = %deployment.group_id,
            strategy = deployment.strategy.name(),
            from = %deployment.previous_version,
            to = %deployment.desired_version,
            instances = deployment.instance_ids.len(),
            "deployment created"
        );
        Ok(Rollout {
            deployment,
            state,
            last_snapshot: None,
        })
    }

    /// Reload a deployment and its progress from the store.
    pub fn load(&self, deployment_id: &str) -> RolloutResult<Rollout> {
        let deployment = self
            .store
            .get_deployment(deployment_id)?
            .ok_or_else(|| RolloutError::NotFound(deployment_id.to_string()))?;
        let state = match self.store.get_strategy_state(deployment_id)? {
            Some(state) => state,
            None => engine::initial_state(&deployment),
        };
        let last_snapshot = self.store.latest_snapshot(deployment_id)?;
        Ok(Rollout {
            deployment,
            state,
            last_snapshot,
        })
    }

    /// Run one control-loop iteration.
    pub async fn tick(&self, rollout: &mut Rollout) -> RolloutResult<TickOutcome> {
        match rollout.deployment.status {
            DeploymentStatus::Paused => return Ok(TickOutcome::Idle),
            status if status.is_terminal() => return Ok(TickOutcome::Idle),
            DeploymentStatus::Pending => {
                self.transition(rollout, DeploymentStatus::InProgress);
            }
            _ => {}
        }
        rollout.state.ticks += 1;

        if rollout.deployment.abort_requested {
            return self.finish_rollback(rollout).await;
        }

        let action = if rollout.state.gate_open {
            engine::next_action(&rollout.deployment, &mut rollout.state, None)
        } else {
            let snapshot = self.evaluate(rollout).await?;
            match engine::next_action(&rollout.deployment, &mut rollout.state, Some(&snapshot)) {
                NextAction::Expose(_) => {
                    self.persist(rollout)?;
                    return Ok(TickOutcome::GateOpened {
                        step: rollout.step(),
                    });
                }
                other => other,
            }
        };

        let exposure = match action {
            NextAction::Expose(exposure) => exposure,
            NextAction::Hold => {
                self.persist(rollout)?;
                return Ok(TickOutcome::Held {
                    step: rollout.step(),
                });
            }
            NextAction::Complete => return self.succeed(rollout),
            NextAction::Rollback { reason } => return self.fail_step(rollout, reason).await,
        };

        match self.apply(&rollout.deployment, &exposure).await {
            Ok(()) => {}
            Err(RolloutError::Conflict(group)) => {
                warn!(
                    deployment = %rollout.deployment.id,
                    %group,
                    step = %exposure.label(),
                    "registry contention, exposure deferred"
                );
                self.persist(rollout)?;
                return Ok(TickOutcome::Held {
                    step: rollout.step(),
                });
            }
            Err(e) => {
                let reason = format!("could not apply {}: {e}", exposure.label());
                return self.fail_step(rollout, reason).await;
            }
        }
        engine::record_exposure(&rollout.deployment, &mut rollout.state, &exposure);
        info!(
            deployment = %rollout.deployment.id,
            step = %exposure.label(),
            "exposure applied"
        );

        if exposure.needs_evaluation() {
            let snapshot = self.evaluate(rollout).await?;
            match engine::next_action(&rollout.deployment, &mut rollout.state, Some(&snapshot)) {
                NextAction::Rollback { reason } => return self.fail_step(rollout, reason).await,
                NextAction::Complete => return self.succeed(rollout),
                NextAction::Expose(_) | NextAction::Hold => {}
            }
        } else if engine::next_action(&rollout.deployment, &mut rollout.state, None)
            == NextAction::Complete
        {
            return self.succeed(rollout);
        }

        self.persist(rollout)?;
        Ok(TickOutcome::Advanced {
            step: exposure.label(),
        })
    }

    pub fn pause(&self, rollout: &mut Rollout) -> RolloutResult<CommandOutcome> {
        match rollout.deployment.status {
            status if status.is_terminal() => Ok(CommandOutcome::Terminal),
            DeploymentStatus::Paused => Ok(CommandOutcome::Unchanged),
            DeploymentStatus::InProgress if !rollout.deployment.abort_requested => {
                self.transition(rollout, DeploymentStatus::Paused);
                self.persist(rollout)?;
                Ok(CommandOutcome::Applied)
            }
            DeploymentStatus::InProgress => Err(RolloutError::InvalidTransition {
                op: "pause",
                status: "rolling_back",
            }),
            status => Err(RolloutError::InvalidTransition {
                op: "pause",
                status: status.label(),
            }),
        }
    }

    pub fn resume(&self, rollout: &mut Rollout) -> RolloutResult<CommandOutcome> {
        match rollout.deployment.status {
            status if status.is_terminal() => Ok(CommandOutcome::Terminal),
            DeploymentStatus::InProgress => Ok(CommandOutcome::Unchanged),
            DeploymentStatus::Paused => {
                self.transition(rollout, DeploymentStatus::InProgress);
                self.persist(rollout)?;
                Ok(CommandOutcome::Applied)
            }
            status => Err(RolloutError::InvalidTransition {
                op: "resume",
                status: status.label(),
            }),
        }
    }

    /// Stop the rollout and restore the previous version.
    ///
    /// A paused (or not yet started) deployment is resumed first so the
    /// rollback runs through the normal lifecycle.
    pub async fn abort(&self, rollout: &mut Rollout) -> RolloutResult<CommandOutcome> {
        if rollout.deployment.is_terminal() {
            return Ok(CommandOutcome::Terminal);
        }
        if rollout.deployment.abort_requested {
            return Ok(CommandOutcome::Unchanged);
        }
        if rollout.deployment.status != DeploymentStatus::InProgress {
            self.transition(rollout, DeploymentStatus::InProgress);
        }

        info!(deployment = %rollout.deployment.id, step = %rollout.step(), "abort requested");
        self.request_rollback(rollout, "aborted by operator".to_string())?;
        match self.finish_rollback(rollout).await? {
            TickOutcome::RollbackPending => Ok(CommandOutcome::InProgress),
            _ => Ok(CommandOutcome::Applied),
        }
    }

    /// Evaluate the current cohort and record the snapshot.
    async fn evaluate(&self, rollout: &mut Rollout) -> RolloutResult<CohortSnapshot> {
        let deployment = &rollout.deployment;
        let cohort = engine::cohort(deployment, &rollout.state);
        let thresholds = deployment
            .gate
            .thresholds
            .clone()
            .unwrap_or_else(|| self.evaluator.thresholds().clone());

        let mut snapshot = self
            .evaluator
            .evaluate_with(&deployment.group_id, &cohort, &thresholds)
            .await?;
        snapshot.deployment_id = deployment.id.clone();
        snapshot.step = engine::current_step(deployment, &rollout.state);

        let stored = self.store.append_snapshot(&snapshot)?;
        debug!(
            deployment = %stored.deployment_id,
            seq = stored.seq,
            step = %stored.step,
            verdict = ?stored.verdict,
            "snapshot recorded"
        );
        rollout.last_snapshot = Some(stored.clone());
        Ok(stored)
    }

    /// Carry an exposure out on the registry, retrying revision conflicts.
    async fn apply(&self, deployment: &Deployment, exposure: &Exposure) -> RolloutResult<()> {
        if matches!(exposure, Exposure::Grace { .. }) {
            return Ok(());
        }
        let group_id = deployment.group_id.as_str();
        self.retry
            .on_conflict(|| async {
                let group = self.registry.get_group(group_id)?;
                self.registry
                    .update(group_id, group.revision, |g| apply_exposure(g, deployment, exposure))
            })
            .await?;
        Ok(())
    }

    /// Record a failed step and start the rollback.
    async fn fail_step(&self, rollout: &mut Rollout, reason: String) -> RolloutResult<TickOutcome> {
        warn!(
            deployment = %rollout.deployment.id,
            step = %rollout.step(),
            %reason,
            "step failed, rolling back"
        );
        self.request_rollback(rollout, reason)?;
        self.finish_rollback(rollout).await
    }

    fn request_rollback(&self, rollout: &mut Rollout, reason: String) -> RolloutResult<()> {
        rollout.deployment.abort_requested = true;
        rollout.deployment.failure = Some(FailureReport {
            step: rollout.step(),
            reason,
            snapshot: rollout.last_snapshot.clone(),
        });
        self.persist(rollout)
    }

    async fn finish_rollback(&self, rollout: &mut Rollout) -> RolloutResult<TickOutcome> {
        match self.rollback.rollback(&rollout.deployment).await {
            Ok(report) => {
                rollout.deployment.abort_requested = false;
                self.transition(rollout, DeploymentStatus::RolledBack);
                self.persist(rollout)?;
                info!(
                    deployment = %rollout.deployment.id,
                    version = %report.restored_version,
                    instances = report.instances,
                    "deployment rolled back"
                );
                Ok(TickOutcome::RolledBack)
            }
            Err(e) if e.is_transient() => {
                warn!(deployment = %rollout.deployment.id, error = %e, "rollback pending");
                self.persist(rollout)?;
                Ok(TickOutcome::RollbackPending)
            }
            Err(e) => {
                error!(
                    deployment = %rollout.deployment.id,
                    error = %e,
                    "rollback impossible, operator intervention required"
                );
                let step = rollout.step();
                let snapshot = rollout.last_snapshot.clone();
                let report = rollout.deployment.failure.get_or_insert(FailureReport {
                    step,
                    reason: String::new(),
                    snapshot,
                });
                report.reason = if report.reason.is_empty() {
                    format!("rollback failed: {e}")
                } else {
                    format!("{}; rollback failed: {e}", report.reason)
                };
                self.transition(rollout, DeploymentStatus::Failed);
                self.persist(rollout)?;
                Ok(TickOutcome::Failed)
            }
        }
    }

    fn succeed(&self, rollout: &mut Rollout) -> RolloutResult<TickOutcome> {
        self.transition(rollout, DeploymentStatus::Succeeded);
        self.persist(rollout)?;
        info!(
            deployment = %rollout.deployment.id,
            version = %rollout.deployment.desired_version,
            ticks = rollout.state.ticks,
            "deployment succeeded"
        );
        Ok(TickOutcome::Succeeded)
    }

    fn transition(&self, rollout: &mut Rollout, status: DeploymentStatus) {
        let from = rollout.deployment.status;
        rollout
            .deployment
            .transition(status, rollgate_core::epoch_secs());
        info!(
            deployment = %rollout.deployment.id,
            from = from.label(),
            to = status.label(),
            "deployment status changed"
        );
    }

    fn persist(&self, rollout: &Rollout) -> RolloutResult<()> {
        self.store
            .save_progress(&rollout.deployment, Some(&rollout.state))?;
        Ok(())
    }
}

/// Mutate `group` to reflect `exposure`. Re-applying the same exposure is a no-op.
fn apply_exposure(
    group: &mut TargetGroup,
    deployment: &Deployment,
    exposure: &Exposure,
) -> RegistryResult<()> {
    let version = &deployment.desired_version;
    match exposure {
        Exposure::Batch { instance_ids, .. } => assign_version(group, instance_ids, version),
        Exposure::Canary {
            percent,
            instance_ids,
            ..
        } => {
            assign_version(group, instance_ids, version)?;
            group.traffic = (*percent < 100).then(|| TrafficSplit {
                version: version.clone(),
                percent: *percent,
            });
            Ok(())
        }
        Exposure::ProvisionStandby { instance_ids } => {
            group.standby = instance_ids
                .iter()
                .map(|id| Instance {
                    id: id.clone(),
                    version: version.clone(),
                    health: HealthTag::Unknown,
                })
                .collect();
            Ok(())
        }
        Exposure::Flip => {
            let still_blue = group
                .instances
                .iter()
                .any(|inst| deployment.instance_ids.contains(&inst.id));
            if still_blue {
                std::mem::swap(&mut group.instances, &mut group.standby);
            }
            Ok(())
        }
        Exposure::Grace { .. } => Ok(()),
        Exposure::Decommission => {
            group.standby.clear();
            Ok(())
        }
    }
}
