//! Rollback coordinator — restores the last-known-good version.
//!
//! Every live instance of the deployment's baseline goes back to
//! `previous_version`, a blue-green pool that was already flipped is
//! swapped back, and any standby pool or traffic split is cleared. The
//! result is re-read from the registry before it counts as done.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use rollgate_registry::{RegistryError, TargetRegistry, assign_version};
use rollgate_state::{Deployment, TargetGroup};

use crate::artifact::ArtifactCatalog;
use crate::error::{RolloutError, RolloutResult};
use crate::retry::RetryPolicy;

/// What a confirmed rollback left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub group_id: String,
    pub restored_version: String,
    pub instances: usize,
    /// Group revision the restored state was confirmed at.
    pub revision: u64,
    /// Whether a flipped blue-green pool had to be swapped back.
    pub swapped_back: bool,
    /// False when the group was already restored and nothing was written.
    pub mutated: bool,
}

#[derive(Clone)]
pub struct RollbackCoordinator {
    registry: TargetRegistry,
    catalog: Arc<dyn ArtifactCatalog>,
    retry: RetryPolicy,
}

impl RollbackCoordinator {
    pub fn new(
        registry: TargetRegistry,
        catalog: Arc<dyn ArtifactCatalog>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            catalog,
            retry,
        }
    }

    /// Restore `deployment.previous_version` on its baseline instances.
    ///
    /// Idempotent: a group that is already restored is confirmed without
    /// another write.
    pub async fn rollback(&self, deployment: &Deployment) -> RolloutResult<RollbackReport> {
        let version = &deployment.previous_version;
        if !self.catalog.is_deployable(version) {
            warn!(
                deployment = %deployment.id,
                %version,
                "previous version no longer deployable"
            );
            return Err(RolloutError::IrrecoverableRollback {
                version: version.clone(),
            });
        }

        let group_id = deployment.group_id.as_str();
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.restore(deployment) {
                Ok((swapped_back, mutated)) => {
                    // Confirm against a fresh read.
                    let group = self.registry.snapshot(group_id).map_err(RolloutError::Registry)?;
                    if is_restored(&group, deployment) {
                        info!(
                            deployment = %deployment.id,
                            group = %group_id,
                            %version,
                            revision = group.revision,
                            swapped_back,
                            "rollback confirmed"
                        );
                        return Ok(RollbackReport {
                            group_id: group_id.to_string(),
                            restored_version: version.clone(),
                            instances: group.instances.len(),
                            revision: group.revision,
                            swapped_back,
                            mutated,
                        });
                    }
                    warn!(group = %group_id, attempt, "rollback not visible on re-read");
                }
                Err(RegistryError::Conflict { .. }) => {
                    warn!(group = %group_id, attempt, "rollback write conflicted");
                }
                Err(other) => return Err(RolloutError::Registry(other)),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
        }

        Err(RolloutError::RollbackIncomplete {
            group: group_id.to_string(),
            attempts,
        })
    }

    /// One read-modify-write of the group. Returns `(swapped_back, mutated)`.
    fn restore(&self, deployment: &Deployment) -> Result<(bool, bool), RegistryError> {
        let group = self.registry.get_group(&deployment.group_id)?;
        if is_restored(&group, deployment) {
            return Ok((false, false));
        }

        let baseline: BTreeSet<&str> = deployment.instance_ids.iter().map(String::as_str).collect();
        let live_is_baseline = group.instances.iter().any(|i| baseline.contains(i.id.as_str()));
        let standby_is_baseline = group.standby.iter().any(|i| baseline.contains(i.id.as_str()));
        let swap = !live_is_baseline && standby_is_baseline;

        self.registry.update(&deployment.group_id, group.revision, |g| {
            if swap {
                std::mem::swap(&mut g.instances, &mut g.standby);
            }
            g.standby.clear();
            g.traffic = None;
            assign_version(g, &deployment.instance_ids, &deployment.previous_version)
        })?;
        Ok((swap, true))
    }
}

/// Baseline instances are live on the previous version with no standby
/// pool or traffic split left over.
fn is_restored(group: &TargetGroup, deployment: &Deployment) -> bool {
    group.standby.is_empty()
        && group.traffic.is_none()
        && deployment.instance_ids.iter().all(|iid| {
            group
                .instances
                .iter()
                .any(|inst| &inst.id == iid && inst.version == deployment.previous_version)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{OpenCatalog, RetainedCatalog};
    use rollgate_core::{GateConfig, StrategyKind};
    use rollgate_state::{DeploymentStatus, Instance, StateStore, TrafficSplit};
    use std::time::Duration;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("web-{i}")).collect()
    }

    fn setup(n: usize) -> (TargetRegistry, Deployment) {
        let registry = TargetRegistry::new(StateStore::open_in_memory().unwrap());
        registry.register(&TargetGroup::new("web", "v1", &ids(n))).unwrap();
        let deployment = Deployment {
            id: "d1".into(),
            group_id: "web".into(),
            instance_ids: ids(n),
            strategy: StrategyKind::default(),
            gate: GateConfig::default(),
            desired_version: "v2".into(),
            previous_version: "v1".into(),
            status: DeploymentStatus::InProgress,
            abort_requested: true,
            started_at: 0,
            last_transition_at: 0,
            failure: None,
        };
        (registry, deployment)
    }

    fn coordinator(registry: &TargetRegistry, catalog: Arc<dyn ArtifactCatalog>) -> RollbackCoordinator {
        RollbackCoordinator::new(
            registry.clone(),
            catalog,
            RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn restores_partial_canary() {
        let (registry, deployment) = setup(4);
        let rev = registry.get_group("web").unwrap().revision;
        let group = registry
            .set_instance_versions("web", rev, &["web-0".into(), "web-1".into()], "v2")
            .unwrap();
        registry
            .set_traffic(
                "web",
                group.revision,
                Some(TrafficSplit {
                    version: "v2".into(),
                    percent: 50,
                }),
            )
            .unwrap();

        let report = coordinator(&registry, Arc::new(OpenCatalog))
            .rollback(&deployment)
            .await
            .unwrap();
        assert!(report.mutated);
        assert!(!report.swapped_back);

        let group = registry.get_group("web").unwrap();
        assert_eq!(group.uniform_version(), Some("v1"));
        assert!(group.traffic.is_none());
    }

    #[tokio::test]
    async fn swaps_back_a_flipped_pool() {
        let (registry, deployment) = setup(2);
        let rev = registry.get_group("web").unwrap().revision;
        registry
            .update("web", rev, |g| {
                let green: Vec<Instance> = g
                    .instances
                    .iter()
                    .map(|i| Instance {
                        id: format!("{}-green", i.id),
                        version: "v2".into(),
                        health: i.health,
                    })
                    .collect();
                g.standby = std::mem::replace(&mut g.instances, green);
                Ok(())
            })
            .unwrap();

        let report = coordinator(&registry, Arc::new(OpenCatalog))
            .rollback(&deployment)
            .await
            .unwrap();
        assert!(report.swapped_back);

        let group = registry.get_group("web").unwrap();
        assert_eq!(group.instance_ids(), ids(2));
        assert_eq!(group.uniform_version(), Some("v1"));
        assert!(group.standby.is_empty());
    }

    #[tokio::test]
    async fn second_rollback_writes_nothing() {
        let (registry, deployment) = setup(2);
        let rev = registry.get_group("web").unwrap().revision;
        registry
            .set_instance_versions("web", rev, &["web-0".into()], "v2")
            .unwrap();
        let coord = coordinator(&registry, Arc::new(OpenCatalog));

        let first = coord.rollback(&deployment).await.unwrap();
        let second = coord.rollback(&deployment).await.unwrap();
        assert!(first.mutated);
        assert!(!second.mutated);
        assert_eq!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn missing_artifact_is_irrecoverable() {
        let (registry, deployment) = setup(2);
        let catalog = Arc::new(RetainedCatalog::new(["v2"]));
        let err = coordinator(&registry, catalog)
            .rollback(&deployment)
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::IrrecoverableRollback { .. }));
    }

    #[tokio::test]
    async fn contended_rollback_sleeps_once_per_attempt() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Instant;

        let (registry, deployment) = setup(2);
        let rev = registry.get_group("web").unwrap().revision;
        registry
            .set_instance_versions("web", rev, &["web-0".into()], "v2")
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(group) = registry.get_group("web") {
                        let _ = registry.update("web", group.revision, |_| Ok(()));
                    }
                }
            })
        };

        let coord = RollbackCoordinator::new(
            registry.clone(),
            Arc::new(OpenCatalog),
            RetryPolicy {
                attempts: 4,
                backoff: Duration::from_millis(50),
            },
        );
        let started = Instant::now();
        let result = coord.rollback(&deployment).await;
        let elapsed = started.elapsed();
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        // 50 + 100 + 150 ms of backoff at most.
        assert!(elapsed < Duration::from_millis(900), "took {elapsed:?}");
        if let Err(err) = result {
            assert!(
                matches!(err, RolloutError::RollbackIncomplete { attempts: 4, .. }),
                "{err}"
            );
        }
    }

    #[tokio::test]
    async fn vanished_instance_is_a_registry_error() {
        let (registry, mut deployment) = setup(2);
        deployment.instance_ids.push("web-9".into());
        let err = coordinator(&registry, Arc::new(OpenCatalog))
            .rollback(&deployment)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RolloutError::Registry(RegistryError::UnknownInstance { .. })
        ));
    }
}
