//! Orchestrator — the operator surface over running rollouts.
//!
//! Every non-terminal deployment has exactly one control loop. Commands are
//! forwarded to that loop and answered between ticks; reads go straight to
//! the state store, which the loop updates after every tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use rollgate_core::{GateConfig, StrategyKind};
use rollgate_registry::RegistryError;
use rollgate_rollout::{
    Command, CommandOutcome, Controller, QueueError, RolloutError, RolloutHandle, engine,
    spawn_rollout,
};
use rollgate_state::{
    CohortSnapshot, Deployment, Instance, Progress, StateError, TargetGroup,
};

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("group {group} already has active deployment {deployment}")]
    ActiveDeployment { group: String, deployment: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable code carried in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidConfig(_) => "invalid_config",
            OrchestratorError::ActiveDeployment { .. } => "active_deployment",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvalidTransition(_) => "invalid_transition",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

impl From<RolloutError> for OrchestratorError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::Config(msg) => OrchestratorError::InvalidConfig(msg),
            RolloutError::ActiveDeployment { group, deployment } => {
                OrchestratorError::ActiveDeployment { group, deployment }
            }
            RolloutError::NotFound(id) => OrchestratorError::NotFound(format!("deployment {id}")),
            e @ RolloutError::InvalidTransition { .. } => {
                OrchestratorError::InvalidTransition(e.to_string())
            }
            RolloutError::Registry(RegistryError::NotFound(group)) => {
                OrchestratorError::NotFound(format!("group {group}"))
            }
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<StateError> for OrchestratorError {
    fn from(err: StateError) -> Self {
        RolloutError::from(err).into()
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        RolloutError::from(err).into()
    }
}

/// Timing knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tick_interval: Duration,
    /// How long a command waits for the loop's reply before reporting
    /// `in_progress`.
    pub abort_timeout: Duration,
    /// Gate applied to start requests that carry none.
    pub default_gate: GateConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            abort_timeout: Duration::from_secs(10),
            default_gate: GateConfig::default(),
        }
    }
}

/// Request body to start a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub group_id: String,
    pub version: String,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

/// Request body to register a target group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterGroupRequest {
    pub instances: Vec<Instance>,
}

/// A deployment as reported to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub deployment: Deployment,
    /// Label of the step the deployment sits at.
    pub step: String,
    /// Strategy progress; absent once the deployment is terminal.
    pub progress: Option<Progress>,
    pub latest_snapshot: Option<CohortSnapshot>,
}

/// Result of pause, resume or abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub outcome: CommandOutcome,
    pub deployment: DeploymentView,
}

pub struct Orchestrator {
    controller: Arc<Controller>,
    settings: OrchestratorSettings,
    /// Running loops: deployment_id → handle.
    loops: RwLock<HashMap<String, RolloutHandle>>,
}

impl Orchestrator {
    pub fn new(controller: Arc<Controller>, settings: OrchestratorSettings) -> Self {
        Self {
            controller,
            settings,
            loops: RwLock::new(HashMap::new()),
        }
    }

    /// Validate, persist and start driving a new deployment.
    pub async fn start(&self, req: StartRequest) -> OrchestratorResult<DeploymentView> {
        let gate = req
            .gate
            .unwrap_or_else(|| self.settings.default_gate.clone());
        let rollout = self
            .controller
            .prepare(&req.group_id, &req.version, req.strategy, gate)?;
        let view = self.view(rollout.deployment.clone())?;
        self.spawn(rollout).await;
        Ok(view)
    }

    pub async fn pause(&self, deployment_id: &str) -> OrchestratorResult<OpResult> {
        self.command(deployment_id, Command::Pause).await
    }

    pub async fn resume(&self, deployment_id: &str) -> OrchestratorResult<OpResult> {
        self.command(deployment_id, Command::Resume).await
    }

    pub async fn abort(&self, deployment_id: &str) -> OrchestratorResult<OpResult> {
        self.command(deployment_id, Command::Abort).await
    }

    pub fn status(&self, deployment_id: &str) -> OrchestratorResult<DeploymentView> {
        let deployment = self.load(deployment_id)?;
        self.view(deployment)
    }

    pub fn list(&self) -> OrchestratorResult<Vec<DeploymentView>> {
        self.controller
            .store()
            .list_deployments()?
            .into_iter()
            .map(|d| self.view(d))
            .collect()
    }

    pub fn snapshots(&self, deployment_id: &str) -> OrchestratorResult<Vec<CohortSnapshot>> {
        self.load(deployment_id)?;
        Ok(self.controller.store().list_snapshots(deployment_id)?)
    }

    pub fn group(&self, group_id: &str) -> OrchestratorResult<TargetGroup> {
        Ok(self.controller.registry().get_group(group_id)?)
    }

    pub fn groups(&self) -> OrchestratorResult<Vec<TargetGroup>> {
        Ok(self.controller.registry().list_groups()?)
    }

    /// Register or replace a group. Refused while a deployment holds it.
    pub fn register_group(
        &self,
        group_id: &str,
        req: RegisterGroupRequest,
    ) -> OrchestratorResult<TargetGroup> {
        // Ids travel comma-joined in metrics queries.
        if let Some(bad) = req
            .instances
            .iter()
            .find(|i| i.id.trim().is_empty() || i.id.contains(','))
        {
            return Err(OrchestratorError::InvalidConfig(format!(
                "instance id {:?} must be non-empty and contain no commas",
                bad.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = req.instances.iter().find(|i| !seen.insert(i.id.as_str())) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "duplicate instance id {}",
                dup.id
            )));
        }
        let group = TargetGroup {
            instances: req.instances,
            ..TargetGroup::new(group_id, "", &[])
        };
        // The active-deployment check runs inside the store's write transaction.
        let stored = self.controller.registry().register_idle(&group)?;
        info!(group = %group_id, instances = stored.instances.len(), "group registered");
        Ok(stored)
    }

    /// Restart loops for every non-terminal deployment in the store.
    pub async fn recover(&self) -> OrchestratorResult<usize> {
        let active = self.controller.store().list_active_deployments()?;
        let mut resumed = 0;
        for deployment in active {
            if self.loops.read().await.contains_key(&deployment.id) {
                continue;
            }
            let rollout = self.controller.load(&deployment.id)?;
            info!(
                deployment = %rollout.id(),
                status = rollout.deployment.status.label(),
                step = %rollout.step(),
                "resuming deployment"
            );
            self.spawn(rollout).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Stop every loop after its current tick. State is left as persisted.
    pub async fn shutdown(&self) {
        let handles: Vec<RolloutHandle> = self.loops.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let id = handle.deployment_id().to_string();
            handle.stop().await;
            debug!(deployment = %id, "rollout loop stopped");
        }
        info!("all rollout loops stopped");
    }

    /// Deployment ids with a running loop.
    pub async fn running(&self) -> Vec<String> {
        self.loops
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn spawn(&self, rollout: rollgate_rollout::Rollout) {
        let id = rollout.id().to_string();
        let handle = spawn_rollout(self.controller.clone(), rollout, self.settings.tick_interval);
        let mut loops = self.loops.write().await;
        loops.retain(|_, h| !h.is_finished());
        if let Some(old) = loops.insert(id, handle) {
            old.stop().await;
        }
    }

    async fn command(&self, deployment_id: &str, command: Command) -> OrchestratorResult<OpResult> {
        let deployment = self.load(deployment_id)?;
        if deployment.is_terminal() {
            return Ok(OpResult {
                outcome: CommandOutcome::Terminal,
                deployment: self.view(deployment)?,
            });
        }

        // Queueing never waits, so the lock is only held for the lookup.
        let queued = self
            .loops
            .read()
            .await
            .get(deployment_id)
            .map(|handle| handle.send(command));

        let outcome = match queued {
            Some(Ok(reply)) => match tokio::time::timeout(self.settings.abort_timeout, reply).await {
                Ok(Ok(result)) => result?,
                // The loop exited before answering; the store has the final word.
                Ok(Err(_)) => self.settled_outcome(deployment_id)?,
                Err(_) => {
                    warn!(
                        deployment = %deployment_id,
                        command = command.name(),
                        timeout = ?self.settings.abort_timeout,
                        "command not answered in time"
                    );
                    CommandOutcome::InProgress
                }
            },
            Some(Err(QueueError::Full)) => {
                warn!(
                    deployment = %deployment_id,
                    command = command.name(),
                    "control loop busy, command queue full"
                );
                CommandOutcome::InProgress
            }
            Some(Err(QueueError::Closed)) | None => self.settled_outcome(deployment_id)?,
        };

        let deployment = self.load(deployment_id)?;
        Ok(OpResult {
            outcome,
            deployment: self.view(deployment)?,
        })
    }

    /// Outcome for a command that found no loop to talk to.
    fn settled_outcome(&self, deployment_id: &str) -> OrchestratorResult<CommandOutcome> {
        if self.load(deployment_id)?.is_terminal() {
            Ok(CommandOutcome::Terminal)
        } else {
            Err(OrchestratorError::Internal(format!(
                "no control loop running for deployment {deployment_id}"
            )))
        }
    }

    fn load(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        self.controller
            .store()
            .get_deployment(deployment_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {deployment_id}")))
    }

    fn view(&self, deployment: Deployment) -> OrchestratorResult<DeploymentView> {
        let store = self.controller.store();
        let progress = store.get_strategy_state(&deployment.id)?;
        let step = match &progress {
            Some(state) => engine::current_step(&deployment, state),
            None => deployment
                .failure
                .as_ref()
                .map(|f| f.step.clone())
                .unwrap_or_else(|| "complete".to_string()),
        };
        let latest_snapshot = store.latest_snapshot(&deployment.id)?;
        Ok(DeploymentView {
            deployment,
            step,
            progress: progress.map(|s| s.progress),
            latest_snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{BatchSize, HealthThresholds, RollingConfig};
    use rollgate_health::{HealthEvaluator, ScriptedMetricsSource};
    use rollgate_registry::TargetRegistry;
    use rollgate_rollout::{OpenCatalog, RetryPolicy, RollbackCoordinator};
    use rollgate_state::{DeploymentStatus, StateStore};

    fn controller_with(source: Arc<ScriptedMetricsSource>, eval_timeout: Duration) -> Arc<Controller> {
        let store = StateStore::open_in_memory().unwrap();
        let registry = TargetRegistry::new(store.clone());
        let ids: Vec<String> = (0..4).map(|i| format!("web-{i}")).collect();
        registry.register(&TargetGroup::new("web", "v1", &ids)).unwrap();
        let evaluator = HealthEvaluator::new(source, registry.clone(), HealthThresholds::default())
            .with_timeout(eval_timeout);
        let retry = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let rollback = RollbackCoordinator::new(registry.clone(), Arc::new(OpenCatalog), retry);
        Arc::new(Controller::new(store, registry, evaluator, rollback, retry))
    }

    fn orchestrator_with(
        source: Arc<ScriptedMetricsSource>,
        settings: OrchestratorSettings,
        eval_timeout: Duration,
    ) -> Orchestrator {
        Orchestrator::new(controller_with(source, eval_timeout), settings)
    }

    fn slow_ticks() -> OrchestratorSettings {
        OrchestratorSettings {
            tick_interval: Duration::from_secs(3600),
            abort_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn start_request() -> StartRequest {
        StartRequest {
            group_id: "web".into(),
            version: "v2".into(),
            strategy: StrategyKind::Rolling(RollingConfig {
                batch: BatchSize::Count(1),
            }),
            gate: None,
        }
    }

    async fn wait_for(orch: &Orchestrator, id: &str, status: DeploymentStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if orch.status(id).unwrap().deployment.status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn double_abort_bumps_revision_once() {
        let source = Arc::new(ScriptedMetricsSource::default());
        let orch = orchestrator_with(source, slow_ticks(), Duration::from_secs(1));
        let view = orch.start(start_request()).await.unwrap();
        let id = view.deployment.id.clone();

        let first = orch.abort(&id).await.unwrap();
        assert_eq!(first.outcome, CommandOutcome::Applied);
        assert_eq!(first.deployment.deployment.status, DeploymentStatus::RolledBack);
        let revision = orch.group("web").unwrap().revision;

        let second = orch.abort(&id).await.unwrap();
        assert_eq!(second.outcome, CommandOutcome::Terminal);
        assert_eq!(orch.group("web").unwrap().revision, revision);
        assert_eq!(orch.group("web").unwrap().uniform_version(), Some("v1"));
    }

    #[tokio::test]
    async fn pause_resume_through_loop() {
        let source = Arc::new(ScriptedMetricsSource::default());
        let orch = orchestrator_with(source.clone(), slow_ticks(), Duration::from_secs(1));
        let id = orch.start(start_request()).await.unwrap().deployment.id;
        wait_for(&orch, &id, DeploymentStatus::InProgress).await;

        let paused = orch.pause(&id).await.unwrap();
        assert_eq!(paused.outcome, CommandOutcome::Applied);
        assert_eq!(paused.deployment.deployment.status, DeploymentStatus::Paused);
        assert_eq!(orch.pause(&id).await.unwrap().outcome, CommandOutcome::Unchanged);

        let resumed = orch.resume(&id).await.unwrap();
        assert_eq!(resumed.outcome, CommandOutcome::Applied);
        assert_eq!(resumed.deployment.deployment.status, DeploymentStatus::InProgress);
    }

    #[tokio::test]
    async fn second_start_on_group_conflicts() {
        let orch = orchestrator_with(
            Arc::new(ScriptedMetricsSource::default()),
            slow_ticks(),
            Duration::from_secs(1),
        );
        orch.start(start_request()).await.unwrap();
        let err = orch.start(start_request()).await.unwrap_err();
        assert_eq!(err.code(), "active_deployment");
        assert_eq!(orch.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abort_times_out_then_completes() {
        let source = Arc::new(ScriptedMetricsSource::default());
        source.push_hang();
        let settings = OrchestratorSettings {
            tick_interval: Duration::from_secs(3600),
            abort_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let orch = orchestrator_with(source.clone(), settings, Duration::from_millis(500));
        let id = orch.start(start_request()).await.unwrap().deployment.id;

        // Wait until the first tick is stuck evaluating.
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.queries().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        let result = orch.abort(&id).await.unwrap();
        assert_eq!(result.outcome, CommandOutcome::InProgress);
        wait_for(&orch, &id, DeploymentStatus::RolledBack).await;
        assert_eq!(orch.group("web").unwrap().uniform_version(), Some("v1"));
    }

    #[tokio::test]
    async fn commands_stay_bounded_while_loop_is_stuck() {
        let source = Arc::new(ScriptedMetricsSource::default());
        source.push_hang();
        let settings = OrchestratorSettings {
            tick_interval: Duration::from_secs(3600),
            abort_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let orch = orchestrator_with(source.clone(), settings, Duration::from_secs(30));
        let id = orch.start(start_request()).await.unwrap().deployment.id;
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.queries().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        for _ in 0..rollgate_rollout::COMMAND_QUEUE {
            assert_eq!(orch.pause(&id).await.unwrap().outcome, CommandOutcome::InProgress);
        }
        let started = std::time::Instant::now();
        let overflow = orch.pause(&id).await.unwrap();
        assert_eq!(overflow.outcome, CommandOutcome::InProgress);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Other groups are not held up by the stuck loop.
        let api = RegisterGroupRequest {
            instances: vec![Instance {
                id: "api-0".into(),
                version: "v1".into(),
                health: Default::default(),
            }],
        };
        orch.register_group("api", api).unwrap();
        let other = StartRequest {
            group_id: "api".into(),
            ..start_request()
        };
        let view = tokio::time::timeout(Duration::from_secs(1), orch.start(other))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.deployment.group_id, "api");
    }

    #[tokio::test]
    async fn recover_resumes_active_deployments() {
        let controller = controller_with(Arc::new(ScriptedMetricsSource::default()), Duration::from_secs(1));
        let before = Orchestrator::new(controller.clone(), slow_ticks());
        let id = before.start(start_request()).await.unwrap().deployment.id;
        before.shutdown().await;
        assert!(before.running().await.is_empty());

        let after = Orchestrator::new(
            controller,
            OrchestratorSettings {
                tick_interval: Duration::from_millis(10),
                abort_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        assert_eq!(after.recover().await.unwrap(), 1);
        wait_for(&after, &id, DeploymentStatus::Succeeded).await;
        assert_eq!(after.group("web").unwrap().uniform_version(), Some("v2"));
        assert_eq!(after.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_deployment_is_not_found() {
        let orch = orchestrator_with(
            Arc::new(ScriptedMetricsSource::default()),
            slow_ticks(),
            Duration::from_secs(1),
        );
        assert_eq!(orch.status("nope").unwrap_err().code(), "not_found");
        assert_eq!(orch.abort("nope").await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn register_group_refused_while_active() {
        let orch = orchestrator_with(
            Arc::new(ScriptedMetricsSource::default()),
            slow_ticks(),
            Duration::from_secs(1),
        );
        orch.start(start_request()).await.unwrap();
        let req = RegisterGroupRequest {
            instances: vec![Instance {
                id: "web-0".into(),
                version: "v9".into(),
                health: Default::default(),
            }],
        };
        assert_eq!(
            orch.register_group("web", req.clone()).unwrap_err().code(),
            "active_deployment"
        );
        let group = orch.register_group("api", req).unwrap();
        assert_eq!(group.uniform_version(), Some("v9"));
    }

    #[tokio::test]
    async fn register_group_rejects_unqueryable_ids() {
        let orch = orchestrator_with(
            Arc::new(ScriptedMetricsSource::default()),
            slow_ticks(),
            Duration::from_secs(1),
        );
        for id in ["web-0,web-1", " ", ""] {
            let req = RegisterGroupRequest {
                instances: vec![Instance {
                    id: id.into(),
                    version: "v1".into(),
                    health: Default::default(),
                }],
            };
            assert_eq!(
                orch.register_group("api", req).unwrap_err().code(),
                "invalid_config",
                "id {id:?}"
            );
        }
        assert!(orch.group("api").is_err());
    }
}
