//! redb table definitions for the Rollgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table in the store.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Target groups keyed by `{group_id}`.
pub const GROUPS: JsonTable = TableDefinition::new("groups");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Strategy progress keyed by `{deployment_id}`. Removed once the deployment is terminal.
pub const STRATEGY_STATES: JsonTable = TableDefinition::new("strategy_states");

/// Cohort snapshots keyed by `{deployment_id}:{seq:010}`.
pub const SNAPSHOTS: JsonTable = TableDefinition::new("snapshots");

/// Active deployment per group: `{group_id}` → deployment id bytes.
pub const ACTIVE: JsonTable = TableDefinition::new("active");
