//! Target registry over the state store.

use thiserror::Error;
use tracing::debug;

use rollgate_state::{StateError, StateStore, TargetGroup, TrafficSplit};

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("target group not found: {0}")]
    NotFound(String),

    #[error("instance {instance} not in group {group}")]
    UnknownInstance { group: String, instance: String },

    #[error("group {group} changed concurrently (expected revision {expected}, found {actual})")]
    Conflict {
        group: String,
        expected: u64,
        actual: u64,
    },

    #[error("group {group} is held by active deployment {deployment}")]
    ActiveDeployment { group: String, deployment: String },

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for RegistryError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::RevisionConflict {
                group,
                expected,
                actual,
            } => RegistryError::Conflict {
                group,
                expected,
                actual,
            },
            StateError::NotFound(what) => RegistryError::NotFound(what),
            StateError::ActiveDeployment { group, deployment } => {
                RegistryError::ActiveDeployment { group, deployment }
            }
            other => RegistryError::State(other),
        }
    }
}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }
}

/// Set `version` on each listed instance of `group`.
///
/// Fails on the first id the group does not contain; earlier instances may
/// already be changed, so callers mutate a copy (see [`TargetRegistry::update`]).
pub fn assign_version(
    group: &mut TargetGroup,
    instance_ids: &[String],
    version: &str,
) -> RegistryResult<()> {
    for iid in instance_ids {
        let inst = group
            .instances
            .iter_mut()
            .find(|inst| &inst.id == iid)
            .ok_or_else(|| RegistryError::UnknownInstance {
                group: group.id.clone(),
                instance: iid.clone(),
            })?;
        inst.version = version.to_string();
    }
    Ok(())
}

/// Fleet registry. Cheap to clone; all clones share the same store.
#[derive(Clone)]
pub struct TargetRegistry {
    store: StateStore,
}

impl TargetRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Create or replace a group unconditionally.
    pub fn register(&self, group: &TargetGroup) -> RegistryResult<TargetGroup> {
        let stored = self.store.put_group(group)?;
        debug!(group = %stored.id, instances = stored.instances.len(), "group registered");
        Ok(stored)
    }

    /// Create or replace a group that no unfinished deployment holds.
    pub fn register_idle(&self, group: &TargetGroup) -> RegistryResult<TargetGroup> {
        let stored = self.store.put_idle_group(group)?;
        debug!(group = %stored.id, instances = stored.instances.len(), "group registered");
        Ok(stored)
    }

    pub fn get_group(&self, group_id: &str) -> RegistryResult<TargetGroup> {
        self.store
            .get_group(group_id)?
            .ok_or_else(|| RegistryError::NotFound(group_id.to_string()))
    }

    /// An owned copy of the group as currently committed.
    pub fn snapshot(&self, group_id: &str) -> RegistryResult<TargetGroup> {
        self.get_group(group_id)
    }

    pub fn list_groups(&self) -> RegistryResult<Vec<TargetGroup>> {
        Ok(self.store.list_groups()?)
    }

    /// Assign `version` to the given live instances.
    pub fn set_instance_versions(
        &self,
        group_id: &str,
        expected_revision: u64,
        instance_ids: &[String],
        version: &str,
    ) -> RegistryResult<TargetGroup> {
        self.update(group_id, expected_revision, |group| {
            assign_version(group, instance_ids, version)
        })
    }

    /// Route `percent` of traffic to `version`, or clear the split with `None`.
    pub fn set_traffic(
        &self,
        group_id: &str,
        expected_revision: u64,
        split: Option<TrafficSplit>,
    ) -> RegistryResult<TargetGroup> {
        self.update(group_id, expected_revision, |group| {
            group.traffic = split;
            Ok(())
        })
    }

    /// Apply an arbitrary mutation if the group is still at `expected_revision`.
    ///
    /// The mutation runs on a copy; nothing is written if it returns an error.
    pub fn update<F>(
        &self,
        group_id: &str,
        expected_revision: u64,
        mutate: F,
    ) -> RegistryResult<TargetGroup>
    where
        F: FnOnce(&mut TargetGroup) -> RegistryResult<()>,
    {
        let mut group = self.get_group(group_id)?;
        if group.revision != expected_revision {
            return Err(RegistryError::Conflict {
                group: group_id.to_string(),
                expected: expected_revision,
                actual: group.revision,
            });
        }
        mutate(&mut group)?;
        // The store re-checks the revision inside its write transaction.
        let committed = self.store.compare_and_put_group(&group, expected_revision)?;
        debug!(group = %group_id, revision = committed.revision, "group mutated");
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(group_id: &str, n: usize) -> TargetRegistry {
        let registry = TargetRegistry::new(StateStore::open_in_memory().unwrap());
        let ids: Vec<String> = (0..n).map(|i| format!("{group_id}-{i}")).collect();
        registry
            .register(&TargetGroup::new(group_id, "v1", &ids))
            .unwrap();
        registry
    }

    #[test]
    fn set_versions_bumps_revision() {
        let registry = registry_with("web", 4);
        let group = registry.get_group("web").unwrap();

        let updated = registry
            .set_instance_versions("web", group.revision, &["web-0".into(), "web-1".into()], "v2")
            .unwrap();
        assert_eq!(updated.revision, group.revision + 1);
        assert_eq!(updated.on_version("v2"), vec!["web-0", "web-1"]);
        assert_eq!(registry.snapshot("web").unwrap(), updated);
    }

    #[test]
    fn stale_revision_conflicts() {
        let registry = registry_with("web", 2);
        let stale = registry.get_group("web").unwrap().revision;
        registry
            .set_instance_versions("web", stale, &["web-0".into()], "v2")
            .unwrap();

        let err = registry
            .set_instance_versions("web", stale, &["web-1".into()], "v3")
            .unwrap_err();
        assert!(err.is_conflict());
        // Loser's write never landed.
        assert_eq!(registry.get_group("web").unwrap().on_version("v3").len(), 0);
    }

    #[test]
    fn unknown_group_and_instance() {
        let registry = registry_with("web", 1);
        assert!(matches!(
            registry.get_group("nope").unwrap_err(),
            RegistryError::NotFound(_)
        ));

        let rev = registry.get_group("web").unwrap().revision;
        let err = registry
            .set_instance_versions("web", rev, &["web-7".into()], "v2")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownInstance { .. }));
        assert_eq!(registry.get_group("web").unwrap().revision, rev);
    }

    #[test]
    fn assign_version_names_missing_instance() {
        let mut group = TargetGroup::new("web", "v1", &["web-0".to_string(), "web-1".to_string()]);
        assign_version(&mut group, &["web-1".into()], "v2").unwrap();
        assert_eq!(group.on_version("v2"), vec!["web-1"]);

        let err = assign_version(&mut group, &["web-9".into()], "v3").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnknownInstance { ref group, ref instance } if group == "web" && instance == "web-9"
        ));
    }

    #[test]
    fn traffic_split_set_and_cleared() {
        let registry = registry_with("web", 2);
        let rev = registry.get_group("web").unwrap().revision;
        let group = registry
            .set_traffic(
                "web",
                rev,
                Some(TrafficSplit {
                    version: "v2".into(),
                    percent: 25,
                }),
            )
            .unwrap();
        assert_eq!(group.traffic.as_ref().map(|t| t.percent), Some(25));

        let group = registry.set_traffic("web", group.revision, None).unwrap();
        assert!(group.traffic.is_none());
    }
}
