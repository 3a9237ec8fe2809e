//! Rollout error taxonomy.

use thiserror::Error;

use rollgate_health::HealthError;
use rollgate_registry::RegistryError;
use rollgate_state::StateError;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// Bad strategy parameters or target; rejected before the rollout starts.
    #[error("invalid rollout configuration: {0}")]
    Config(String),

    #[error("group {group} already has active deployment {deployment}")]
    ActiveDeployment { group: String, deployment: String },

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("cannot {op} a deployment that is {status}")]
    InvalidTransition {
        op: &'static str,
        status: &'static str,
    },

    /// Registry contention outlasted the retry budget. Absorbed by the tick.
    #[error("group {0} kept changing concurrently; giving up for this tick")]
    Conflict(String),

    /// The last-known-good artifact is gone. Needs an operator.
    #[error("previous version {version} is no longer deployable")]
    IrrecoverableRollback { version: String },

    #[error("rollback of group {group} not confirmed after {attempts} attempts")]
    RollbackIncomplete { group: String, attempts: u32 },

    #[error("registry error: {0}")]
    Registry(RegistryError),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("health evaluation error: {0}")]
    Health(#[from] HealthError),
}

impl From<RegistryError> for RolloutError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict { group, .. } => RolloutError::Conflict(group),
            RegistryError::ActiveDeployment { group, deployment } => {
                RolloutError::ActiveDeployment { group, deployment }
            }
            other => RolloutError::Registry(other),
        }
    }
}

impl From<StateError> for RolloutError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::ActiveDeployment { group, deployment } => {
                RolloutError::ActiveDeployment { group, deployment }
            }
            other => RolloutError::State(other),
        }
    }
}

impl RolloutError {
    /// Errors a tick absorbs and retries on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RolloutError::Conflict(_) | RolloutError::RollbackIncomplete { .. }
        )
    }
}
