//! StateStore — redb-backed state persistence for Rollgate.
//!
//! Provides typed operations over target groups, deployments, strategy
//! progress, and cohort snapshots. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [GROUPS, DEPLOYMENTS, STRATEGY_STATES, SNAPSHOTS, ACTIVE] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Target groups ──────────────────────────────────────────────

    /// Insert or replace a target group, bumping its revision past any stored one.
    pub fn put_group(&self, group: &TargetGroup) -> StateResult<TargetGroup> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = replace_group_in(&txn, group)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %stored.id, revision = stored.revision, "group stored");
        Ok(stored)
    }

    /// Like [`put_group`](Self::put_group), but refused while a non-terminal
    /// deployment holds the group. Checked in the same transaction as the write.
    pub fn put_idle_group(&self, group: &TargetGroup) -> StateResult<TargetGroup> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        ensure_idle_in(&txn, &group.id)?;
        let stored = replace_group_in(&txn, group)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %stored.id, revision = stored.revision, "idle group stored");
        Ok(stored)
    }

    /// Get a target group by id.
    pub fn get_group(&self, group_id: &str) -> StateResult<Option<TargetGroup>> {
        self.get(GROUPS, group_id)
    }

    /// List all target groups.
    pub fn list_groups(&self) -> StateResult<Vec<TargetGroup>> {
        self.list_prefix(GROUPS, "")
    }

    /// Replace a group only if its stored revision still equals `expected_revision`.
    ///
    /// The committed group carries `expected_revision + 1`.
    pub fn compare_and_put_group(
        &self,
        group: &TargetGroup,
        expected_revision: u64,
    ) -> StateResult<TargetGroup> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let current: TargetGroup = read_in(&txn, GROUPS, &group.id)?
                .ok_or_else(|| StateError::NotFound(format!("group {}", group.id)))?;
            if current.revision != expected_revision {
                return Err(StateError::RevisionConflict {
                    group: group.id.clone(),
                    expected: expected_revision,
                    actual: current.revision,
                });
            }
            let mut next = group.clone();
            next.revision = expected_revision + 1;
            next.updated_at = rollgate_core::epoch_secs();
            write_in(&txn, GROUPS, &next.id, &next)?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %stored.id, revision = stored.revision, "group updated");
        Ok(stored)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a new deployment with its initial strategy state, claiming its group.
    ///
    /// Fails with `ActiveDeployment` if another non-terminal deployment holds the group.
    pub fn create_deployment(
        &self,
        deployment: &Deployment,
        state: &StrategyState,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            ensure_idle_in(&txn, &deployment.group_id)?;
            write_in(&txn, ACTIVE, &deployment.group_id, &deployment.id)?;
            write_in(&txn, DEPLOYMENTS, &deployment.id, deployment)?;
            write_in(&txn, STRATEGY_STATES, &deployment.id, state)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment.id, group = %deployment.group_id, "deployment created");
        Ok(())
    }

    /// Persist a deployment together with its strategy progress.
    ///
    /// A terminal deployment drops its strategy state and releases its group
    /// in the same transaction.
    pub fn save_progress(
        &self,
        deployment: &Deployment,
        state: Option<&StrategyState>,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            write_in(&txn, DEPLOYMENTS, &deployment.id, deployment)?;
            if deployment.is_terminal() {
                remove_in(&txn, STRATEGY_STATES, &deployment.id)?;
                let holder: Option<String> = read_in(&txn, ACTIVE, &deployment.group_id)?;
                if holder.as_deref() == Some(deployment.id.as_str()) {
                    remove_in(&txn, ACTIVE, &deployment.group_id)?;
                }
            } else if let Some(state) = state {
                write_in(&txn, STRATEGY_STATES, &deployment.id, state)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            deployment = %deployment.id,
            status = deployment.status.label(),
            "deployment progress stored"
        );
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, deployment_id)
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.list_prefix(DEPLOYMENTS, "")
    }

    /// List deployments that have not reached a terminal status.
    pub fn list_active_deployments(&self) -> StateResult<Vec<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| !d.is_terminal())
            .collect())
    }

    /// The deployment currently holding a group, if any.
    pub fn active_deployment_for_group(&self, group_id: &str) -> StateResult<Option<String>> {
        self.get(ACTIVE, group_id)
    }

    /// Get the persisted strategy progress of a deployment.
    pub fn get_strategy_state(&self, deployment_id: &str) -> StateResult<Option<StrategyState>> {
        self.get(STRATEGY_STATES, deployment_id)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Append a snapshot to its deployment's history, assigning the next sequence number.
    pub fn append_snapshot(&self, snapshot: &CohortSnapshot) -> StateResult<CohortSnapshot> {
        let prefix = format!("{}:", snapshot.deployment_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let last: Option<CohortSnapshot> = {
                let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
                let mut last = None;
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    if key.value().starts_with(&prefix) {
                        last = Some(value.value().to_vec());
                    }
                }
                last.map(|bytes| serde_json::from_slice(&bytes))
                    .transpose()
                    .map_err(map_err!(Deserialize))?
            };
            let mut next = snapshot.clone();
            next.seq = last.map_or(0, |s| s.seq + 1);
            write_in(&txn, SNAPSHOTS, &next.table_key(), &next)?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// All snapshots of a deployment, oldest first.
    pub fn list_snapshots(&self, deployment_id: &str) -> StateResult<Vec<CohortSnapshot>> {
        self.list_prefix(SNAPSHOTS, &format!("{deployment_id}:"))
    }

    /// The most recent snapshot of a deployment.
    pub fn latest_snapshot(&self, deployment_id: &str) -> StateResult<Option<CohortSnapshot>> {
        Ok(self.list_snapshots(deployment_id)?.pop())
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_prefix<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }
}

fn read_in<T: DeserializeOwned>(
    txn: &WriteTransaction,
    def: JsonTable,
    key: &str,
) -> StateResult<Option<T>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let bytes = table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec());
    bytes
        .map(|b| serde_json::from_slice(&b))
        .transpose()
        .map_err(map_err!(Deserialize))
}

fn write_in<T: Serialize + ?Sized>(
    txn: &WriteTransaction,
    def: JsonTable,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Fail with `ActiveDeployment` if a non-terminal deployment holds `group_id`.
fn ensure_idle_in(txn: &WriteTransaction, group_id: &str) -> StateResult<()> {
    let holder: Option<String> = read_in(txn, ACTIVE, group_id)?;
    if let Some(holder) = holder {
        let held: Option<Deployment> = read_in(txn, DEPLOYMENTS, &holder)?;
        if held.is_some_and(|d| !d.is_terminal()) {
            return Err(StateError::ActiveDeployment {
                group: group_id.to_string(),
                deployment: holder,
            });
        }
    }
    Ok(())
}

/// Write `group` over any stored copy, bumping the revision past it.
fn replace_group_in(txn: &WriteTransaction, group: &TargetGroup) -> StateResult<TargetGroup> {
    let current: Option<TargetGroup> = read_in(txn, GROUPS, &group.id)?;
    let mut next = group.clone();
    next.revision = current.map_or(group.revision, |c| c.revision.max(group.revision) + 1);
    next.updated_at = rollgate_core::epoch_secs();
    write_in(txn, GROUPS, &next.id, &next)?;
    Ok(next)
}

fn remove_in(txn: &WriteTransaction, def: JsonTable, key: &str) -> StateResult<()> {
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table.remove(key).map_err(map_err!(Write))?;
    Ok(())
}
